//! Users, permissions, file filters and virtual folders.
//!
//! Everything in this module is pure: permission and filter checks never
//! touch storage, so they can run before any backend call.

use glob::{MatchOptions, Pattern, PatternError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use strum::{Display, EnumString};

use crate::config::FilesystemConfig;
use crate::vfs::path::{ancestors, clean_path, file_name, is_within, parent};
use crate::vfs::{DirEntry, FileAttr};

/// A permission granted on a directory and everything below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Permission {
    /// Every permission.
    #[serde(rename = "*")]
    #[strum(serialize = "*")]
    Any,
    List,
    Download,
    Upload,
    Overwrite,
    Delete,
    Rename,
    CreateDirs,
    CreateSymlinks,
    Chmod,
    Chown,
    Chtimes,
}

const NAME_MATCH: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A shell-style file name pattern, compiled when the user is loaded.
///
/// Matching ignores case. An invalid pattern fails deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FilePattern(Pattern);

impl FilePattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        Pattern::new(pattern).map(Self)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.0.matches_with(name, NAME_MATCH)
    }
}

impl TryFrom<String> for FilePattern {
    type Error = PatternError;

    fn try_from(pattern: String) -> Result<Self, Self::Error> {
        Self::new(&pattern)
    }
}

impl From<FilePattern> for String {
    fn from(pattern: FilePattern) -> Self {
        pattern.0.as_str().to_string()
    }
}

/// Name patterns applied to files in one directory subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternFilter {
    pub path: String,
    pub allowed_patterns: Vec<FilePattern>,
    pub denied_patterns: Vec<FilePattern>,
}

impl PatternFilter {
    /// A filter for `path` built from pattern strings.
    pub fn new(path: &str, allowed: &[&str], denied: &[&str]) -> Result<Self, PatternError> {
        let compile = |list: &[&str]| list.iter().map(|p| FilePattern::new(p)).collect::<Result<Vec<_>, _>>();
        Ok(Self {
            path: path.to_string(),
            allowed_patterns: compile(allowed)?,
            denied_patterns: compile(denied)?,
        })
    }
}

/// Per-user restrictions beyond permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserFilters {
    pub file_patterns: Vec<PatternFilter>,
    /// Largest single upload in bytes, 0 for no limit.
    pub max_upload_file_size: u64,
}

/// A local directory mounted into the user's virtual tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualFolder {
    /// Unique folder name; quota usage is tracked under it.
    pub name: String,
    pub mapped_path: PathBuf,
    pub virtual_path: String,
    /// Folder size limit in bytes, 0 for none.
    pub quota_size: u64,
    /// Folder file-count limit, 0 for none.
    pub quota_files: u64,
    /// Whether usage inside the folder also counts against the user.
    pub included_in_user_quota: bool,
}

impl VirtualFolder {
    pub fn has_quota_limits(&self) -> bool {
        self.quota_size > 0 || self.quota_files > 0
    }
}

/// An account that can log in and transfer files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub username: String,
    /// bcrypt hash, see [`crate::store::hash_password`].
    pub password_hash: String,
    pub home_dir: PathBuf,
    pub uid: u32,
    pub gid: u32,
    /// Directory → granted permissions.
    pub permissions: HashMap<String, Vec<Permission>>,
    pub filters: UserFilters,
    /// Size limit in bytes, 0 for none.
    pub quota_size: u64,
    /// File-count limit, 0 for none.
    pub quota_files: u64,
    pub virtual_folders: Vec<VirtualFolder>,
    /// Sub-tree sessions are scoped to, empty for the whole tree.
    pub folder_prefix: String,
    pub filesystem: FilesystemConfig,
}

impl User {
    /// A user with full permissions on `/`.
    pub fn new(username: impl Into<String>, home_dir: impl Into<PathBuf>) -> Self {
        let mut permissions = HashMap::new();
        permissions.insert("/".to_string(), vec![Permission::Any]);
        Self {
            username: username.into(),
            home_dir: home_dir.into(),
            permissions,
            ..Default::default()
        }
    }

    /// Builder: replace the permissions granted on `dir`.
    pub fn with_permissions(mut self, dir: &str, perms: Vec<Permission>) -> Self {
        self.permissions.insert(clean_path(dir), perms);
        self
    }

    /// Builder: add a virtual folder.
    pub fn with_virtual_folder(mut self, folder: VirtualFolder) -> Self {
        self.virtual_folders.push(folder);
        self
    }

    /// Permissions that apply to `dir`: those of the most specific
    /// configured directory that is `dir` or one of its ancestors.
    pub fn permissions_for(&self, dir: &str) -> &[Permission] {
        for candidate in ancestors(dir) {
            if let Some((_, perms)) = self
                .permissions
                .iter()
                .find(|(configured, _)| clean_path(configured) == candidate)
            {
                return perms;
            }
        }
        &[]
    }

    /// True if `perm` is granted on `dir`.
    pub fn has_perm(&self, perm: Permission, dir: &str) -> bool {
        let perms = self.permissions_for(dir);
        perms.contains(&Permission::Any) || perms.contains(&perm)
    }

    /// True if every permission in `perms` is granted on `dir`.
    pub fn has_perms(&self, perms: &[Permission], dir: &str) -> bool {
        perms.iter().all(|p| self.has_perm(*p, dir))
    }

    /// Check a file name against the pattern filter of its directory.
    ///
    /// Denied patterns win; a non-empty allow list must match.
    pub fn is_file_allowed(&self, virtual_path: &str) -> bool {
        let dir = parent(virtual_path);
        let Some(filter) = self.pattern_filter_for(&dir) else {
            return true;
        };
        let name = file_name(virtual_path);
        if filter.denied_patterns.iter().any(|p| p.matches(&name)) {
            return false;
        }
        filter.allowed_patterns.is_empty() || filter.allowed_patterns.iter().any(|p| p.matches(&name))
    }

    fn pattern_filter_for(&self, dir: &str) -> Option<&PatternFilter> {
        ancestors(dir).into_iter().find_map(|candidate| {
            self.filters
                .file_patterns
                .iter()
                .find(|f| clean_path(&f.path) == candidate)
        })
    }

    /// The most specific virtual folder containing `virtual_path`.
    pub fn virtual_folder_for_path(&self, virtual_path: &str) -> Option<&VirtualFolder> {
        let cleaned = clean_path(virtual_path);
        self.virtual_folders
            .iter()
            .filter(|f| is_within(&cleaned, &clean_path(&f.virtual_path)))
            .max_by_key(|f| clean_path(&f.virtual_path).len())
    }

    /// True if `virtual_path` is exactly a virtual folder's mount point.
    pub fn is_virtual_folder(&self, virtual_path: &str) -> bool {
        let cleaned = clean_path(virtual_path);
        self.virtual_folders
            .iter()
            .any(|f| clean_path(&f.virtual_path) == cleaned)
    }

    /// True if some virtual folder is mounted strictly below `virtual_path`.
    pub fn has_virtual_folders_inside(&self, virtual_path: &str) -> bool {
        let cleaned = clean_path(virtual_path);
        self.virtual_folders.iter().any(|f| {
            let mount = clean_path(&f.virtual_path);
            mount != cleaned && is_within(&mount, &cleaned)
        })
    }

    /// Add directory entries for virtual folders mounted directly inside
    /// `virtual_path` that the backend listing does not already show.
    pub fn add_virtual_dirs(&self, mut entries: Vec<DirEntry>, virtual_path: &str) -> Vec<DirEntry> {
        let cleaned = clean_path(virtual_path);
        let mut added = false;
        for folder in &self.virtual_folders {
            let mount = clean_path(&folder.virtual_path);
            if mount == "/" || parent(&mount) != cleaned {
                continue;
            }
            let name = file_name(&mount);
            if entries.iter().any(|e| e.name == name) {
                continue;
            }
            entries.push(DirEntry::new(name, FileAttr::directory(std::time::SystemTime::now())));
            added = true;
        }
        if added {
            entries.sort_by(|a, b| a.name.cmp(&b.name));
        }
        entries
    }

    /// Owner to apply to new files; ids 0 and above 65535 are not applied.
    pub fn owner(&self) -> (Option<u32>, Option<u32>) {
        let valid = |id: u32| (id > 0 && id <= 65535).then_some(id);
        (valid(self.uid), valid(self.gid))
    }

    pub fn has_quota_limits(&self) -> bool {
        self.quota_size > 0 || self.quota_files > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User::new("alice", "/srv/alice")
            .with_permissions("/", vec![Permission::List, Permission::Download])
            .with_permissions("/uploads", vec![Permission::Upload, Permission::List])
            .with_permissions("/uploads/locked", vec![])
    }

    #[test]
    fn test_permission_inheritance() {
        let u = user();
        assert!(u.has_perm(Permission::Download, "/"));
        assert!(u.has_perm(Permission::Download, "/docs/deep"));
        assert!(!u.has_perm(Permission::Upload, "/docs"));

        assert!(u.has_perm(Permission::Upload, "/uploads"));
        assert!(u.has_perm(Permission::Upload, "/uploads/x/y"));
        // The more specific directory replaces, not extends.
        assert!(!u.has_perm(Permission::Download, "/uploads"));
        assert!(!u.has_perm(Permission::List, "/uploads/locked"));
    }

    #[test]
    fn test_any_grants_everything() {
        let u = User::new("bob", "/srv/bob");
        assert!(u.has_perm(Permission::Chown, "/a/b"));
        assert!(u.has_perms(&[Permission::Delete, Permission::Rename], "/"));
    }

    #[test]
    fn test_no_permissions_configured() {
        let mut u = User::new("carol", "/srv/carol");
        u.permissions.clear();
        assert!(!u.has_perm(Permission::List, "/"));
    }

    #[test]
    fn test_permission_names() {
        let json = serde_json::to_string(&vec![Permission::Any, Permission::CreateDirs]).unwrap();
        assert_eq!(json, r#"["*","create_dirs"]"#);
        assert_eq!("create_symlinks".parse::<Permission>().unwrap(), Permission::CreateSymlinks);
        assert_eq!("*".parse::<Permission>().unwrap(), Permission::Any);
    }

    #[test]
    fn test_file_patterns() {
        let mut u = User::new("dave", "/srv/dave");
        u.filters.file_patterns = vec![
            PatternFilter::new("/", &[], &["*.exe"]).unwrap(),
            PatternFilter::new("/images", &["*.jpg", "*.png"], &["secret?.png"]).unwrap(),
        ];

        assert!(u.is_file_allowed("/notes.txt"));
        assert!(!u.is_file_allowed("/setup.EXE"));
        assert!(u.is_file_allowed("/images/cat.JPG"));
        assert!(u.is_file_allowed("/images/2024/dog.png"));
        assert!(!u.is_file_allowed("/images/notes.txt"));
        assert!(!u.is_file_allowed("/images/secret1.png"));
        // The /images filter replaces the root one below it.
        assert!(!u.is_file_allowed("/images/setup.exe"));
    }

    #[test]
    fn test_pattern_classes() {
        let digit = FilePattern::new("file[0-9].txt").unwrap();
        assert!(digit.matches("file7.txt"));
        assert!(!FilePattern::new("file[!0-9].txt").unwrap().matches("file7.txt"));
        assert!(FilePattern::new("a.b").unwrap().matches("A.B"));
        assert!(!FilePattern::new("a.b").unwrap().matches("axb"));
        assert!(FilePattern::new("[").is_err());
    }

    #[test]
    fn test_patterns_compiled_on_load() {
        let filter: PatternFilter =
            serde_json::from_str(r#"{"path": "/", "denied_patterns": ["*.EXE"]}"#).unwrap();
        assert!(filter.denied_patterns[0].matches("setup.exe"));
        assert_eq!(
            serde_json::to_value(&filter).unwrap()["denied_patterns"],
            serde_json::json!(["*.EXE"])
        );

        let invalid = serde_json::from_str::<PatternFilter>(r#"{"denied_patterns": ["["]}"#);
        assert!(invalid.is_err());
    }

    #[test]
    fn test_virtual_folders() {
        let u = User::new("erin", "/srv/erin")
            .with_virtual_folder(VirtualFolder {
                name: "shared".into(),
                mapped_path: "/srv/shared".into(),
                virtual_path: "/data/shared".into(),
                ..Default::default()
            })
            .with_virtual_folder(VirtualFolder {
                name: "inner".into(),
                mapped_path: "/srv/inner".into(),
                virtual_path: "/data/shared/inner".into(),
                ..Default::default()
            });

        assert_eq!(u.virtual_folder_for_path("/data/shared/a.txt").unwrap().name, "shared");
        assert_eq!(u.virtual_folder_for_path("/data/shared/inner/b").unwrap().name, "inner");
        assert!(u.virtual_folder_for_path("/data").is_none());
        assert!(u.virtual_folder_for_path("/data/sharedx").is_none());

        assert!(u.is_virtual_folder("/data/shared/"));
        assert!(!u.is_virtual_folder("/data"));
        assert!(u.has_virtual_folders_inside("/data"));
        assert!(u.has_virtual_folders_inside("/"));
        assert!(!u.has_virtual_folders_inside("/data/shared/inner"));
    }

    #[test]
    fn test_add_virtual_dirs() {
        let u = User::new("frank", "/srv/frank").with_virtual_folder(VirtualFolder {
            name: "shared".into(),
            mapped_path: "/srv/shared".into(),
            virtual_path: "/shared".into(),
            ..Default::default()
        });
        let entries = vec![DirEntry::new("z.txt", FileAttr::file(1, std::time::SystemTime::now()))];
        let entries = u.add_virtual_dirs(entries, "/");
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["shared", "z.txt"]);
        assert!(entries[0].attr.is_dir());

        let again = u.add_virtual_dirs(entries.clone(), "/");
        assert_eq!(again.len(), 2);
        assert_eq!(u.add_virtual_dirs(vec![], "/other").len(), 0);
    }

    #[test]
    fn test_owner() {
        let mut u = User::new("gina", "/srv/gina");
        assert_eq!(u.owner(), (None, None));
        u.uid = 1000;
        u.gid = 70000;
        assert_eq!(u.owner(), (Some(1000), None));
    }
}
