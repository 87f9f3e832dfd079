//! Quota checks and usage accounting.
//!
//! Usage is charged to the virtual folder a path lives in, and to the user
//! as well when that folder counts against the user's quota. Paths outside
//! any folder charge the user only.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::store::{Usage, UserStore};
use crate::user::{User, VirtualFolder};
use crate::vfs::path::parent;
use crate::vfs::{Fs, VfsError, VfsResult};

/// Outcome of a quota check. Computed per request, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaResult {
    pub has_space: bool,
    /// Size limit of the checked scope, 0 for none.
    pub quota_size: u64,
    pub used_size: u64,
    /// File-count limit of the checked scope, 0 for none.
    pub quota_files: u64,
    pub used_files: u64,
}

impl Default for QuotaResult {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl QuotaResult {
    pub fn unlimited() -> Self {
        Self {
            has_space: true,
            quota_size: 0,
            used_size: 0,
            quota_files: 0,
            used_files: 0,
        }
    }

    fn denied() -> Self {
        Self {
            has_space: false,
            ..Self::unlimited()
        }
    }

    fn from_usage(quota_size: u64, quota_files: u64, used: Usage, check_files: bool) -> Self {
        let files_full = check_files && quota_files > 0 && used.files >= quota_files;
        let size_full = quota_size > 0 && used.size >= quota_size;
        Self {
            has_space: !files_full && !size_full,
            quota_size,
            used_size: used.size,
            quota_files,
            used_files: used.files,
        }
    }

    /// Bytes left, `None` when size is unlimited.
    pub fn remaining_size(&self) -> Option<u64> {
        (self.quota_size > 0).then(|| self.quota_size.saturating_sub(self.used_size))
    }

    /// Files left, `None` when the count is unlimited.
    pub fn remaining_files(&self) -> Option<u64> {
        (self.quota_files > 0).then(|| self.quota_files.saturating_sub(self.used_files))
    }

    /// The stricter of two results over the same request.
    fn stricter(self, other: Self) -> Self {
        if !self.has_space {
            return self;
        }
        if !other.has_space {
            return other;
        }
        match (self.remaining_size(), other.remaining_size()) {
            (None, Some(_)) => other,
            (Some(a), Some(b)) if b < a => other,
            _ => self,
        }
    }
}

fn no_restrictions(quota_size: u64, quota_files: u64, check_files: bool) -> bool {
    quota_size == 0 && (!check_files || quota_files == 0)
}

/// Quota policy over a [`UserStore`].
#[derive(Clone)]
pub struct QuotaManager {
    store: Arc<dyn UserStore>,
    tracking: bool,
}

impl QuotaManager {
    pub fn new(store: Arc<dyn UserStore>, tracking: bool) -> Self {
        Self { store, tracking }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    /// The virtual folder whose quota scope `virtual_path` falls in.
    pub fn folder_for<'a>(&self, user: &'a User, virtual_path: &str) -> Option<&'a VirtualFolder> {
        user.virtual_folder_for_path(&parent(virtual_path))
    }

    /// Check whether a write at `virtual_path` fits the applicable quota.
    ///
    /// `check_files` is set when the write would create a new file.
    pub async fn check_space(&self, user: &User, check_files: bool, virtual_path: &str) -> QuotaResult {
        if !self.tracking {
            return QuotaResult::unlimited();
        }
        let folder = self.folder_for(user, virtual_path);

        if let Some(folder) = folder.filter(|f| !f.included_in_user_quota) {
            if no_restrictions(folder.quota_size, folder.quota_files, check_files) {
                return QuotaResult::unlimited();
            }
            return match self.store.used_folder_quota(&folder.name).await {
                Ok(used) => QuotaResult::from_usage(folder.quota_size, folder.quota_files, used, check_files),
                Err(e) => {
                    warn!(folder = %folder.name, error = %e, "unable to read folder usage");
                    QuotaResult::denied()
                }
            };
        }

        let mut result = QuotaResult::unlimited();
        if !no_restrictions(user.quota_size, user.quota_files, check_files) {
            result = match self.store.used_quota(&user.username).await {
                Ok(used) => QuotaResult::from_usage(user.quota_size, user.quota_files, used, check_files),
                Err(e) => {
                    warn!(user = %user.username, error = %e, "unable to read user usage");
                    return QuotaResult::denied();
                }
            };
        }

        // An included folder with its own limits must satisfy both.
        if let Some(folder) = folder.filter(|f| !no_restrictions(f.quota_size, f.quota_files, check_files)) {
            let folder_result = match self.store.used_folder_quota(&folder.name).await {
                Ok(used) => QuotaResult::from_usage(folder.quota_size, folder.quota_files, used, check_files),
                Err(e) => {
                    warn!(folder = %folder.name, error = %e, "unable to read folder usage");
                    return QuotaResult::denied();
                }
            };
            result = result.stricter(folder_result);
        }
        result
    }

    /// Largest number of bytes the upload may end at, `None` for no limit.
    ///
    /// For a resume the bound is relative to the current file size; for a
    /// truncating write the existing bytes are given back first.
    pub fn max_write_size(
        &self,
        user: &User,
        result: &QuotaResult,
        is_resume: bool,
        file_size: u64,
        resume_supported: bool,
    ) -> VfsResult<Option<u64>> {
        let mut max = result.remaining_size();
        let max_upload = user.filters.max_upload_file_size;
        if is_resume {
            if !resume_supported {
                return Err(VfsError::unsupported("upload resume"));
            }
            if max_upload > 0 && max_upload <= file_size {
                return Err(VfsError::QuotaExceeded);
            }
            if max_upload > 0 {
                let remaining = max_upload - file_size;
                max = Some(max.map_or(remaining, |m| m.min(remaining)));
            }
        } else {
            max = max.map(|m| m.saturating_add(file_size));
            if max_upload > 0 {
                max = Some(max.map_or(max_upload, |m| m.min(max_upload)));
            }
        }
        Ok(max)
    }

    /// Charge a usage delta for `virtual_path` to its folder and/or user.
    ///
    /// Store failures are logged; a transfer that already happened is
    /// never failed because its accounting could not be written.
    pub async fn update_usage(&self, user: &User, virtual_path: &str, files: i64, size: i64) {
        if !self.tracking || (files == 0 && size == 0) {
            return;
        }
        debug!(user = %user.username, path = virtual_path, files, size, "updating quota usage");
        match self.folder_for(user, virtual_path) {
            Some(folder) => {
                if let Err(e) = self.store.update_folder_quota(&folder.name, files, size, false).await {
                    warn!(folder = %folder.name, error = %e, "unable to update folder usage");
                }
                if folder.included_in_user_quota {
                    self.update_user(user, files, size).await;
                }
            }
            None => self.update_user(user, files, size).await,
        }
    }

    async fn update_user(&self, user: &User, files: i64, size: i64) {
        if let Err(e) = self.store.update_quota(&user.username, files, size, false).await {
            warn!(user = %user.username, error = %e, "unable to update user usage");
        }
    }

    fn same_scope(&self, user: &User, a: &str, b: &str) -> bool {
        match (self.folder_for(user, a), self.folder_for(user, b)) {
            (None, None) => true,
            (Some(x), Some(y)) => x.name == y.name,
            _ => false,
        }
    }

    /// Whether moving `source` to `target` fits the target's quota.
    ///
    /// `replaced_size` is the size of an existing file being overwritten.
    pub async fn has_space_for_rename(
        &self,
        user: &User,
        fs: &dyn Fs,
        source: &str,
        target: &str,
        replaced_size: Option<u64>,
        fs_source: &Path,
    ) -> bool {
        if !self.tracking || self.same_scope(user, source, target) {
            return true;
        }
        if self.folder_for(user, source).is_none()
            && self.folder_for(user, target).is_some_and(|f| f.included_in_user_quota && !f.has_quota_limits())
        {
            return true;
        }

        let result = self.check_space(user, true, target).await;
        if !result.has_space && replaced_size.is_none() {
            return false;
        }
        let Ok((files, size)) = moved_usage(fs, fs_source).await else {
            return false;
        };
        let (files_diff, size_diff) = match replaced_size {
            Some(replaced) => (0i64, size as i64 - replaced as i64),
            None => (files as i64, size as i64),
        };
        if let Some(remaining) = result.remaining_files() {
            if (remaining as i64) < files_diff {
                return false;
            }
        }
        if let Some(remaining) = result.remaining_size() {
            if (remaining as i64) < size_diff {
                return false;
            }
        }
        true
    }

    /// Move usage between scopes after a successful rename.
    pub async fn update_after_rename(
        &self,
        user: &User,
        fs: &dyn Fs,
        source: &str,
        target: &str,
        fs_target: &Path,
        replaced_size: Option<u64>,
    ) -> VfsResult<()> {
        if !self.tracking {
            return Ok(());
        }
        if self.same_scope(user, source, target) {
            if let Some(replaced) = replaced_size {
                self.update_usage(user, target, -1, -(replaced as i64)).await;
            }
            return Ok(());
        }
        let (files, size) = moved_usage(fs, fs_target).await?;
        let (files, size) = (files as i64, size as i64);
        self.update_usage(user, source, -files, -size).await;
        match replaced_size {
            Some(replaced) => self.update_usage(user, target, 0, size - replaced as i64).await,
            None => self.update_usage(user, target, files, size).await,
        }
        Ok(())
    }
}

/// Files and bytes carried by a rename of `path`.
async fn moved_usage(fs: &dyn Fs, path: &Path) -> VfsResult<(u64, u64)> {
    let attr = fs.lstat(path).await?;
    if attr.is_dir() {
        fs.dir_usage(path).await
    } else if attr.is_file() {
        Ok((1, attr.size))
    } else {
        Ok((1, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn setup(user: User) -> (Arc<MemoryStore>, QuotaManager, User) {
        let store = Arc::new(MemoryStore::new());
        store.add_user(user.clone());
        let quota = QuotaManager::new(store.clone(), true);
        (store, quota, user)
    }

    fn limited(size: u64, files: u64) -> User {
        let mut user = User::new("alice", "/srv/alice");
        user.quota_size = size;
        user.quota_files = files;
        user
    }

    fn shared(included: bool, size: u64) -> VirtualFolder {
        VirtualFolder {
            name: "shared".into(),
            mapped_path: "/srv/shared".into(),
            virtual_path: "/shared".into(),
            quota_size: size,
            quota_files: 0,
            included_in_user_quota: included,
        }
    }

    #[tokio::test]
    async fn test_unlimited_without_tracking() {
        let store = Arc::new(MemoryStore::new());
        let quota = QuotaManager::new(store, false);
        let result = quota.check_space(&limited(1, 1), true, "/a").await;
        assert!(result.has_space);
        assert_eq!(result.remaining_size(), None);
    }

    #[tokio::test]
    async fn test_user_limits() {
        let (store, quota, user) = setup(limited(100, 2));
        store.update_quota("alice", 1, 60, false).await.unwrap();

        let result = quota.check_space(&user, true, "/a.txt").await;
        assert!(result.has_space);
        assert_eq!(result.remaining_size(), Some(40));
        assert_eq!(result.remaining_files(), Some(1));

        store.update_quota("alice", 1, 0, false).await.unwrap();
        assert!(!quota.check_space(&user, true, "/b.txt").await.has_space);
        // Overwrites don't add a file.
        assert!(quota.check_space(&user, false, "/a.txt").await.has_space);
    }

    #[tokio::test]
    async fn test_unknown_user_denied() {
        let store = Arc::new(MemoryStore::new());
        let quota = QuotaManager::new(store, true);
        assert!(!quota.check_space(&limited(10, 0), true, "/a").await.has_space);
    }

    #[tokio::test]
    async fn test_excluded_folder_uses_own_limits() {
        let user = limited(10, 0).with_virtual_folder(shared(false, 1000));
        let (store, quota, user) = setup(user);
        store.update_quota("alice", 0, 10, false).await.unwrap();

        assert!(!quota.check_space(&user, true, "/a").await.has_space);
        let result = quota.check_space(&user, true, "/shared/a").await;
        assert!(result.has_space);
        assert_eq!(result.remaining_size(), Some(1000));
    }

    #[tokio::test]
    async fn test_included_folder_checks_both() {
        let user = limited(1000, 0).with_virtual_folder(shared(true, 50));
        let (store, quota, user) = setup(user);
        store.update_folder_quota("shared", 0, 20, false).await.unwrap();

        let result = quota.check_space(&user, true, "/shared/a").await;
        assert!(result.has_space);
        assert_eq!(result.remaining_size(), Some(30));

        store.update_folder_quota("shared", 0, 30, false).await.unwrap();
        assert!(!quota.check_space(&user, true, "/shared/a").await.has_space);
        assert!(quota.check_space(&user, true, "/home.txt").await.has_space);
    }

    #[tokio::test]
    async fn test_update_usage_routing() {
        let user = limited(0, 0)
            .with_virtual_folder(shared(true, 0))
            .with_virtual_folder(VirtualFolder {
                name: "private".into(),
                virtual_path: "/private".into(),
                ..Default::default()
            });
        let (store, quota, user) = setup(user);

        quota.update_usage(&user, "/a.txt", 1, 10).await;
        quota.update_usage(&user, "/shared/b.txt", 1, 20).await;
        quota.update_usage(&user, "/private/c.txt", 1, 40).await;

        assert_eq!(store.used_quota("alice").await.unwrap(), Usage { files: 2, size: 30 });
        assert_eq!(store.used_folder_quota("shared").await.unwrap(), Usage { files: 1, size: 20 });
        assert_eq!(store.used_folder_quota("private").await.unwrap(), Usage { files: 1, size: 40 });
    }

    #[tokio::test]
    async fn test_soft_quota_race() {
        let (store, quota, user) = setup(limited(100, 0));
        store.update_quota("alice", 0, 90, false).await.unwrap();

        // Both uploads pass the check before either commits.
        let first = quota.check_space(&user, true, "/one").await;
        let second = quota.check_space(&user, true, "/two").await;
        assert!(first.has_space && second.has_space);

        quota.update_usage(&user, "/one", 1, 10).await;
        quota.update_usage(&user, "/two", 1, 10).await;
        assert_eq!(store.used_quota("alice").await.unwrap().size, 110);
        assert!(!quota.check_space(&user, true, "/three").await.has_space);
    }

    #[test]
    fn test_max_write_size() {
        let store = Arc::new(MemoryStore::new());
        let quota = QuotaManager::new(store, true);
        let mut user = limited(0, 0);
        let unlimited = QuotaResult::unlimited();
        let remaining = QuotaResult {
            has_space: true,
            quota_size: 100,
            used_size: 40,
            quota_files: 0,
            used_files: 0,
        };

        assert_eq!(quota.max_write_size(&user, &unlimited, false, 0, true).unwrap(), None);
        // Truncating gives the old bytes back.
        assert_eq!(quota.max_write_size(&user, &remaining, false, 30, true).unwrap(), Some(90));
        assert_eq!(quota.max_write_size(&user, &remaining, true, 30, true).unwrap(), Some(60));

        user.filters.max_upload_file_size = 50;
        assert_eq!(quota.max_write_size(&user, &unlimited, false, 0, true).unwrap(), Some(50));
        assert_eq!(quota.max_write_size(&user, &remaining, false, 30, true).unwrap(), Some(50));
        assert_eq!(quota.max_write_size(&user, &unlimited, true, 20, true).unwrap(), Some(30));
        assert!(matches!(
            quota.max_write_size(&user, &unlimited, true, 50, true),
            Err(VfsError::QuotaExceeded)
        ));
        assert!(matches!(
            quota.max_write_size(&user, &unlimited, true, 0, false),
            Err(VfsError::Unsupported(_))
        ));
    }
}
