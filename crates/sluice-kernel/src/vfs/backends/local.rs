//! Local filesystem backend.
//!
//! Serves a user's home directory plus any virtual folders mapped onto
//! other local directories. Path security is enforced on every resolve:
//! once symlinks are followed, a path must still lie under the home
//! directory or under the folder it was mapped through.

use async_trait::async_trait;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use crate::config::FilesystemProvider;
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::{BackendFile, Fs, OpenedFile};
use crate::vfs::path::{clean_path, is_within, join};
use crate::vfs::types::{DirEntry, FileAttr, FileType, OpenFlags};

const ATOMIC_UPLOAD_PREFIX: &str = ".sluice-upload";

#[derive(Debug, Clone)]
struct FolderMount {
    virtual_path: String,
    mapped_path: PathBuf,
}

/// Local filesystem backend.
///
/// `/docs/a.txt` resolves to `<root>/docs/a.txt`, unless `/docs` is a
/// mapped folder, in which case it resolves below the folder's mapped
/// directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    folders: Vec<FolderMount>,
}

fn canonical_or_raw(path: PathBuf) -> PathBuf {
    path.canonicalize().unwrap_or(path)
}

impl LocalBackend {
    /// Create a backend rooted at the given path.
    ///
    /// The root is canonicalized at construction time so that
    /// confinement checks compare like with like.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: canonical_or_raw(root.into()),
            folders: Vec::new(),
        }
    }

    /// Builder: map `virtual_path` onto a local directory.
    pub fn with_folder(mut self, virtual_path: &str, mapped_path: impl Into<PathBuf>) -> Self {
        self.folders.push(FolderMount {
            virtual_path: clean_path(virtual_path),
            mapped_path: canonical_or_raw(mapped_path.into()),
        });
        // Longest virtual path wins.
        self.folders
            .sort_by(|a, b| b.virtual_path.len().cmp(&a.virtual_path.len()));
        self
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Base directory and the remainder of `virtual_path` below it.
    fn mount_for<'a>(&'a self, virtual_path: &'a str) -> (&'a Path, &'a str) {
        for folder in &self.folders {
            if is_within(virtual_path, &folder.virtual_path) {
                let rest = &virtual_path[folder.virtual_path.len()..];
                return (&folder.mapped_path, rest);
            }
        }
        (&self.root, virtual_path)
    }

    /// Fail unless `full`, or its nearest existing ancestor, resolves
    /// under `base` once symlinks are followed.
    fn check_confined(full: &Path, base: &Path, virtual_path: &str) -> VfsResult<()> {
        let mut current = Some(full);
        while let Some(candidate) = current {
            if let Ok(real) = candidate.canonicalize() {
                if real.starts_with(base) {
                    return Ok(());
                }
                return Err(VfsError::path_invalid(virtual_path));
            }
            current = candidate.parent();
        }
        Ok(())
    }

    fn metadata_to_attr(meta: &std::fs::Metadata) -> FileAttr {
        let kind = if meta.is_dir() {
            FileType::Directory
        } else if meta.file_type().is_symlink() {
            FileType::Symlink
        } else {
            FileType::File
        };

        FileAttr {
            size: meta.len(),
            kind,
            perm: meta.permissions().mode() & 0o7777,
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            atime: meta.accessed().ok(),
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
        }
    }
}

#[async_trait]
impl Fs for LocalBackend {
    fn name(&self) -> &'static str {
        "osfs"
    }

    fn provider(&self) -> FilesystemProvider {
        FilesystemProvider::Local
    }

    fn resolve_path(&self, virtual_path: &str) -> VfsResult<PathBuf> {
        let cleaned = clean_path(virtual_path);
        let (base, rest) = self.mount_for(&cleaned);
        let rest = rest.trim_start_matches('/');
        let full = if rest.is_empty() {
            base.to_path_buf()
        } else {
            base.join(rest)
        };
        Self::check_confined(&full, base, &cleaned)?;
        Ok(full)
    }

    fn virtual_path(&self, fs_path: &Path) -> String {
        for folder in &self.folders {
            if let Ok(rest) = fs_path.strip_prefix(&folder.mapped_path) {
                return join(&folder.virtual_path, &rest.to_string_lossy());
            }
        }
        match fs_path.strip_prefix(&self.root) {
            Ok(rest) => clean_path(&rest.to_string_lossy()),
            Err(_) => "/".to_string(),
        }
    }

    async fn lstat(&self, path: &Path) -> VfsResult<FileAttr> {
        let meta = fs::symlink_metadata(path).await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn stat(&self, path: &Path) -> VfsResult<FileAttr> {
        let meta = fs::metadata(path).await?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn read_dir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(path).await?;

        while let Some(entry) = dir.next_entry().await? {
            let meta = match fs::symlink_metadata(entry.path()).await {
                Ok(meta) => meta,
                // Removed between listing and stat.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            entries.push(DirEntry::new(
                entry.file_name().to_string_lossy().into_owned(),
                Self::metadata_to_attr(&meta),
            ));
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn readlink(&self, path: &Path) -> VfsResult<PathBuf> {
        let target = fs::read_link(path).await?;
        if target.is_absolute() {
            return Ok(target);
        }
        let parent = path.parent().unwrap_or(&self.root);
        let joined = parent.join(target);
        // Lexical cleanup only; the target may not exist.
        Ok(PathBuf::from(clean_path(&joined.to_string_lossy())))
    }

    async fn open(&self, path: &Path, offset: u64) -> VfsResult<OpenedFile> {
        let mut file = fs::File::open(path).await?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        Ok(OpenedFile::new(Box::new(LocalFile { file })))
    }

    async fn create(&self, path: &Path, flags: OpenFlags) -> VfsResult<OpenedFile> {
        let mut options = fs::OpenOptions::new();
        options
            .read(flags.read)
            .write(true)
            .truncate(flags.truncate);
        if flags.exclusive && flags.create {
            options.create_new(true);
        } else {
            options.create(flags.create);
        }
        let file = options.open(path).await?;
        Ok(OpenedFile::new(Box::new(LocalFile { file })))
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        fs::rename(from, to).await?;
        Ok(())
    }

    async fn remove(&self, path: &Path, is_dir: bool) -> VfsResult<()> {
        if is_dir {
            fs::remove_dir(path).await?;
        } else {
            fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn mkdir(&self, path: &Path) -> VfsResult<()> {
        let mut builder = fs::DirBuilder::new();
        builder.mode(0o755);
        builder.create(path).await?;
        Ok(())
    }

    async fn symlink(&self, target: &Path, link: &Path) -> VfsResult<()> {
        fs::symlink(target, link).await?;
        Ok(())
    }

    async fn chmod(&self, path: &Path, mode: u32) -> VfsResult<()> {
        let permissions = std::fs::Permissions::from_mode(mode);
        fs::set_permissions(path, permissions).await?;
        Ok(())
    }

    async fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> VfsResult<()> {
        std::os::unix::fs::chown(path, uid, gid)?;
        Ok(())
    }

    async fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let times = std::fs::FileTimes::new()
            .set_accessed(atime)
            .set_modified(mtime);
        std::fs::File::open(path)?.set_times(times)?;
        Ok(())
    }

    async fn truncate(&self, path: &Path, size: u64) -> VfsResult<()> {
        let file = fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(size).await?;
        Ok(())
    }

    fn is_atomic_upload_supported(&self) -> bool {
        true
    }

    fn atomic_upload_path(&self, path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = format!("{ATOMIC_UPLOAD_PREFIX}.{}.{name}", Uuid::new_v4().simple());
        match path.parent() {
            Some(dir) => dir.join(temp),
            None => PathBuf::from(temp),
        }
    }

    fn is_local_or_proxied(&self) -> bool {
        true
    }

    fn is_upload_resume_supported(&self) -> bool {
        true
    }
}

/// Open local file.
struct LocalFile {
    file: fs::File,
}

#[async_trait]
impl BackendFile for LocalFile {
    async fn read_at(&mut self, offset: u64, len: u32) -> VfsResult<Vec<u8>> {
        self.file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = self.file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> VfsResult<usize> {
        self.file.seek(std::io::SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(data.len())
    }

    async fn truncate(&mut self, size: u64) -> VfsResult<()> {
        self.file.set_len(size).await?;
        Ok(())
    }

    async fn close(&mut self) -> VfsResult<()> {
        self.file.flush().await?;
        Ok(())
    }

    async fn abort(&mut self) -> VfsResult<bool> {
        self.file.flush().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalBackend) {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path());
        (temp, backend)
    }

    #[tokio::test]
    async fn test_write_and_read_back() {
        let (_temp, backend) = setup();
        let path = backend.resolve_path("/hello.txt").unwrap();

        let mut opened = backend.create(&path, OpenFlags::create_truncate()).await.unwrap();
        opened.file.write_at(0, b"hello ").await.unwrap();
        opened.file.write_at(6, b"world").await.unwrap();
        opened.file.close().await.unwrap();

        let mut opened = backend.open(&path, 0).await.unwrap();
        assert_eq!(opened.file.read_at(0, 64).await.unwrap(), b"hello world");
        assert_eq!(opened.file.read_at(6, 3).await.unwrap(), b"wor");
        assert!(opened.file.read_at(64, 8).await.unwrap().is_empty());
        assert_eq!(backend.stat(&path).await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn test_resolve_rejects_symlink_escape() {
        let (temp, backend) = setup();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("escape")).unwrap();

        assert!(matches!(
            backend.resolve_path("/escape/secret"),
            Err(VfsError::PathInvalid(_))
        ));
        assert!(backend.resolve_path("/missing/deeper/file").is_ok());
    }

    #[tokio::test]
    async fn test_dotdot_stays_in_root() {
        let (_temp, backend) = setup();
        let path = backend.resolve_path("/../../etc/passwd").unwrap();
        assert!(path.starts_with(backend.root()));
        assert_eq!(backend.virtual_path(&path), "/etc/passwd");
    }

    #[tokio::test]
    async fn test_folder_mapping() {
        let (_temp, backend) = setup();
        let mapped = TempDir::new().unwrap();
        let backend = backend.with_folder("/shared", mapped.path());

        let path = backend.resolve_path("/shared/report.csv").unwrap();
        assert!(path.starts_with(mapped.path().canonicalize().unwrap()));
        assert_eq!(backend.virtual_path(&path), "/shared/report.csv");
        assert_eq!(
            backend.virtual_path(&backend.resolve_path("/shared").unwrap()),
            "/shared"
        );
        assert_eq!(backend.virtual_path(Path::new("/definitely/elsewhere")), "/");
    }

    #[tokio::test]
    async fn test_read_dir_sorted_with_symlinks() {
        let (temp, backend) = setup();
        std::fs::write(temp.path().join("b.txt"), "b").unwrap();
        std::fs::create_dir(temp.path().join("a")).unwrap();
        std::os::unix::fs::symlink("b.txt", temp.path().join("c")).unwrap();

        let entries = backend.read_dir(backend.root()).await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b.txt", "c"]);
        assert!(entries[0].attr.is_dir());
        assert!(entries[2].attr.is_symlink());

        let target = backend.readlink(&backend.root().join("c")).await.unwrap();
        assert_eq!(backend.virtual_path(&target), "/b.txt");
    }

    #[tokio::test]
    async fn test_remove_and_mkdir() {
        let (_temp, backend) = setup();
        let dir = backend.resolve_path("/sub").unwrap();
        backend.mkdir(&dir).await.unwrap();
        assert!(backend.mkdir(&dir).await.is_err());

        let file = backend.resolve_path("/sub/f").unwrap();
        backend.create(&file, OpenFlags::create_truncate()).await.unwrap();
        assert!(backend.remove(&dir, true).await.is_err());
        backend.remove(&file, false).await.unwrap();
        backend.remove(&dir, true).await.unwrap();
        assert!(backend.lstat(&dir).await.unwrap_err().is_not_exist());
    }

    #[tokio::test]
    async fn test_attribute_changes() {
        let (_temp, backend) = setup();
        let path = backend.resolve_path("/f").unwrap();
        std::fs::write(&path, "0123456789").unwrap();

        backend.chmod(&path, 0o600).await.unwrap();
        assert_eq!(backend.stat(&path).await.unwrap().perm, 0o600);

        backend.truncate(&path, 4).await.unwrap();
        assert_eq!(backend.stat(&path).await.unwrap().size, 4);

        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        backend.chtimes(&path, when, when).await.unwrap();
        assert_eq!(backend.stat(&path).await.unwrap().mtime, when);
    }

    #[test]
    fn test_atomic_upload_path_is_sibling() {
        let backend = LocalBackend::new("/srv/data");
        let temp = backend.atomic_upload_path(Path::new("/srv/data/dir/file.bin"));
        assert_eq!(temp.parent(), Some(Path::new("/srv/data/dir")));
        let name = temp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(ATOMIC_UPLOAD_PREFIX));
        assert!(name.ends_with(".file.bin"));
    }
}
