//! Per-session request routing.
//!
//! A [`Connection`] is created once a user has authenticated. It owns the
//! session's backend, its folder-prefix scope and its open transfers, and
//! turns every [`Request`] into permission checks, quota checks and
//! backend calls. Client paths are scoped and stripped before anything
//! else touches them.

mod request;

pub use request::{Request, Response};

use dashmap::DashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{FilesystemProvider, Settings};
use crate::prefix::PathVirtualizer;
use crate::quota::QuotaManager;
use crate::transfer::{ReadBlock, Transfer, TransferDirection, UploadParams};
use crate::user::{Permission, User};
use crate::vfs::path::{clean_path, file_name, parent};
use crate::vfs::{DirEntry, FileAttr, Fs, OpenFlags, SetAttr, VfsError, VfsResult};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Canonical parent joined with the final name, so a symlink is not
/// mistaken for its target.
async fn normalized(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(dir), Some(name)) => tokio::fs::canonicalize(dir)
            .await
            .map(|d| d.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// One authenticated client session.
pub struct Connection {
    id: String,
    user: Arc<User>,
    remote_addr: Option<SocketAddr>,
    client_version: String,
    virtualizer: PathVirtualizer,
    fs: Arc<dyn Fs>,
    quota: QuotaManager,
    settings: Settings,
    transfers: DashMap<u64, Arc<Transfer>>,
    next_transfer_id: AtomicU64,
    last_activity: AtomicI64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user", &self.user.username)
            .field("backend", &self.fs.name())
            .field("prefix", &self.virtualizer.prefix())
            .field("transfers", &self.transfers.len())
            .finish()
    }
}

impl Connection {
    /// A session for `user` on `fs`, scoped to the user's folder prefix.
    pub fn new(user: User, fs: Arc<dyn Fs>, quota: QuotaManager, settings: Settings) -> Self {
        let virtualizer = PathVirtualizer::new(&user.folder_prefix);
        Self {
            id: Uuid::new_v4().to_string(),
            user: Arc::new(user),
            remote_addr: None,
            client_version: String::new(),
            virtualizer,
            fs,
            quota,
            settings,
            transfers: DashMap::new(),
            next_transfer_id: AtomicU64::new(1),
            last_activity: AtomicI64::new(now_millis()),
        }
    }

    /// Builder: peer address and client identification string.
    pub fn with_remote(mut self, remote_addr: Option<SocketAddr>, client_version: impl Into<String>) -> Self {
        self.remote_addr = remote_addr;
        self.client_version = client_version.into();
        self
    }

    /// Builder: override the folder prefix the session is scoped to.
    pub fn with_folder_prefix(mut self, prefix: &str) -> Self {
        self.virtualizer.set_prefix(prefix);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn fs(&self) -> &Arc<dyn Fs> {
        &self.fs
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    pub fn folder_prefix(&self) -> &str {
        self.virtualizer.prefix()
    }

    /// Record client activity now.
    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Time since the last request.
    pub fn idle_time(&self) -> Duration {
        let elapsed = now_millis() - self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }

    pub fn transfer(&self, id: u64) -> Option<Arc<Transfer>> {
        self.transfers.get(&id).map(|t| t.value().clone())
    }

    /// Handle one request.
    #[tracing::instrument(
        skip(self, request),
        name = "conn.handle",
        fields(conn = %self.id, user = %self.user.username, method = request.method())
    )]
    pub async fn handle(&self, request: Request) -> VfsResult<Response> {
        self.touch();
        match request {
            Request::Read { path } => self.file_read(&path).await,
            Request::Write { path, flags } => self.file_write(&path, flags).await,
            Request::List { path } => self.file_list(&path).await,
            Request::Stat { path } => self.stat(&path, false).await,
            Request::Lstat { path } => self.stat(&path, true).await,
            Request::Readlink { path } => self.readlink(&path).await,
            cmd => self.file_cmd(cmd).await,
        }
    }

    /// Close a transfer handle, settling its upload and quota.
    pub async fn close_transfer(&self, id: u64) -> VfsResult<()> {
        self.touch();
        match self.transfers.remove(&id) {
            Some((_, transfer)) => transfer.close().await,
            None => Ok(()),
        }
    }

    /// End the session: abort whatever is still open and release the backend.
    pub async fn close(&self) -> VfsResult<()> {
        let ids: Vec<u64> = self.transfers.iter().map(|t| *t.key()).collect();
        for id in ids {
            if let Some((_, transfer)) = self.transfers.remove(&id) {
                if let Err(e) = transfer.abort(VfsError::other("connection closed")).await {
                    debug!(path = transfer.virtual_path(), error = %e, "transfer aborted");
                }
            }
        }
        info!(conn = %self.id, user = %self.user.username, "connection closed");
        self.fs.close().await
    }

    // ========================================================================
    // Scoping
    // ========================================================================

    /// Strip the session prefix, rejecting paths outside it as absent.
    fn scoped(&self, path: &str) -> VfsResult<String> {
        let (stripped, in_scope) = self.virtualizer.strip_prefix(path);
        if !in_scope {
            return Err(VfsError::not_exist(path));
        }
        Ok(clean_path(&stripped))
    }

    fn next_id(&self) -> u64 {
        self.next_transfer_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, transfer: Transfer) -> Response {
        let transfer = Arc::new(transfer);
        self.transfers.insert(transfer.id(), transfer.clone());
        Response::Transfer(transfer)
    }

    fn require(&self, perm: Permission, dir: &str, virtual_path: &str) -> VfsResult<()> {
        if self.user.has_perm(perm, dir) {
            Ok(())
        } else {
            Err(VfsError::permission_denied(virtual_path))
        }
    }

    /// True if `fs_path` is the mapped directory of a virtual folder.
    async fn is_mapped_path(&self, fs_path: &Path) -> bool {
        if self.fs.provider() != FilesystemProvider::Local {
            return false;
        }
        let normalized_path = normalized(fs_path).await;
        for folder in &self.user.virtual_folders {
            let mapped = tokio::fs::canonicalize(&folder.mapped_path)
                .await
                .unwrap_or_else(|_| folder.mapped_path.clone());
            if mapped == normalized_path {
                return true;
            }
        }
        false
    }

    fn is_cross_folders(&self, a: &str, b: &str) -> bool {
        match (
            self.user.virtual_folder_for_path(a),
            self.user.virtual_folder_for_path(b),
        ) {
            (None, None) => false,
            (Some(x), Some(y)) => x.name != y.name,
            _ => true,
        }
    }

    /// Apply the user's owner to a new file or directory, best effort.
    async fn apply_owner(&self, fs_path: &Path) {
        let (uid, gid) = self.user.owner();
        if uid.is_none() && gid.is_none() {
            return;
        }
        if let Err(e) = self.fs.chown(fs_path, uid, gid).await {
            debug!(path = %fs_path.display(), error = %e, "unable to set owner");
        }
    }

    // ========================================================================
    // Downloads
    // ========================================================================

    async fn file_read(&self, path: &str) -> VfsResult<Response> {
        let vp = self.scoped(path)?;
        self.require(Permission::Download, &parent(&vp), &vp)?;
        if !self.user.is_file_allowed(&vp) {
            warn!(path = %vp, "reading file is not allowed");
            return Err(VfsError::permission_denied(vp));
        }
        let fs_path = self.fs.resolve_path(&vp)?;
        let opened = self
            .fs
            .open(&fs_path, 0)
            .await
            .inspect_err(|e| warn!(path = %fs_path.display(), error = %e, "could not open file for reading"))?;
        Ok(self.register(Transfer::download(
            self.next_id(),
            self.fs.clone(),
            self.user.clone(),
            self.quota.clone(),
            opened,
            fs_path,
            vp,
        )))
    }

    // ========================================================================
    // Uploads
    // ========================================================================

    async fn file_write(&self, path: &str, flags: OpenFlags) -> VfsResult<Response> {
        let vp = self.scoped(path)?;
        if !self.user.is_file_allowed(&vp) {
            warn!(path = %vp, "writing file is not allowed");
            return Err(VfsError::permission_denied(vp));
        }
        let fs_path = self.fs.resolve_path(&vp)?;
        let effective_path = if self.settings.atomic_upload && self.fs.is_atomic_upload_supported() {
            self.fs.atomic_upload_path(&fs_path)
        } else {
            fs_path.clone()
        };

        let mut read_block = None;
        if flags.read && !self.fs.is_local_or_proxied() {
            read_block = Some(ReadBlock::Unsupported);
        }
        if !self.user.has_perm(Permission::Download, &parent(&vp)) {
            read_block = Some(ReadBlock::PermissionDenied);
        }

        let target = UploadParams {
            fs_path,
            effective_path,
            virtual_path: vp,
            min_write_offset: 0,
            initial_size: 0,
            max_write_size: None,
            is_new_file: true,
            original_moved: false,
            replaces_file: !self.fs.is_local_or_proxied(),
            read_block,
        };

        match self.fs.lstat(&target.fs_path).await {
            Ok(attr) if attr.is_symlink() => self.upload_new(target, flags).await,
            Err(e) if e.is_not_exist() => self.upload_new(target, flags).await,
            Err(e) => {
                warn!(path = %target.fs_path.display(), error = %e, "error performing file stat");
                Err(e)
            }
            Ok(attr) if attr.is_dir() => {
                warn!(path = %target.virtual_path, "attempted to open a directory for writing");
                Err(VfsError::unsupported("writing to a directory"))
            }
            Ok(attr) => self.upload_existing(target, flags, attr.size).await,
        }
    }

    async fn upload_new(&self, mut params: UploadParams, flags: OpenFlags) -> VfsResult<Response> {
        let vp = params.virtual_path.clone();
        self.require(Permission::Upload, &parent(&vp), &vp)?;

        let quota = self.quota.check_space(&self.user, true, &vp).await;
        if !quota.has_space {
            info!(path = %vp, "denying file write due to quota limits");
            return Err(VfsError::QuotaExceeded);
        }
        params.max_write_size =
            self.quota
                .max_write_size(&self.user, &quota, false, 0, self.fs.is_upload_resume_supported())?;

        let create_flags = OpenFlags {
            read: flags.read,
            ..OpenFlags::create_truncate()
        };
        let opened = self
            .fs
            .create(&params.effective_path, create_flags)
            .await
            .inspect_err(|e| warn!(path = %params.effective_path.display(), error = %e, "error creating file"))?;
        self.apply_owner(&params.effective_path).await;

        Ok(self.register(Transfer::upload(
            self.next_id(),
            self.fs.clone(),
            self.user.clone(),
            self.quota.clone(),
            opened,
            params,
        )))
    }

    async fn upload_existing(&self, mut params: UploadParams, flags: OpenFlags, file_size: u64) -> VfsResult<Response> {
        let vp = params.virtual_path.clone();
        self.require(Permission::Overwrite, &parent(&vp), &vp)?;

        let quota = self.quota.check_space(&self.user, false, &vp).await;
        if !quota.has_space {
            info!(path = %vp, "denying file write due to quota limits");
            return Err(VfsError::QuotaExceeded);
        }
        let is_resume = flags.is_resume();
        params.max_write_size = self.quota.max_write_size(
            &self.user,
            &quota,
            is_resume,
            file_size,
            self.fs.is_upload_resume_supported(),
        )?;

        let atomic = params.effective_path != params.fs_path;
        // A truncating atomic upload writes a fresh temp file and leaves the
        // original in place until commit; any other atomic open needs the
        // existing bytes, so the original is moved aside and restored on failure.
        let fresh_temp = atomic && flags.truncate && !is_resume;
        params.original_moved = atomic && !fresh_temp;
        if params.original_moved {
            self.fs
                .rename(&params.fs_path, &params.effective_path)
                .await
                .inspect_err(|e| warn!(path = %params.fs_path.display(), error = %e, "error renaming existing file for atomic upload"))?;
        }
        let open_flags = if fresh_temp {
            OpenFlags {
                read: flags.read,
                ..OpenFlags::create_truncate()
            }
        } else {
            flags
        };
        let opened = match self.fs.create(&params.effective_path, open_flags).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(path = %params.effective_path.display(), error = %e, "error opening existing file");
                if params.original_moved {
                    if let Err(e) = self.fs.rename(&params.effective_path, &params.fs_path).await {
                        warn!(path = %params.fs_path.display(), error = %e, "unable to restore original file");
                    }
                }
                return Err(e);
            }
        };

        if is_resume {
            params.min_write_offset = file_size;
            params.initial_size = file_size;
        } else if fresh_temp {
            params.initial_size = file_size;
            params.replaces_file = true;
        } else if self.fs.is_local_or_proxied() && flags.truncate {
            // The old bytes are gone as of now.
            self.quota
                .update_usage(&self.user, &vp, 0, -(file_size as i64))
                .await;
        } else {
            params.initial_size = file_size;
        }
        params.is_new_file = false;
        self.apply_owner(&params.effective_path).await;

        Ok(self.register(Transfer::upload(
            self.next_id(),
            self.fs.clone(),
            self.user.clone(),
            self.quota.clone(),
            opened,
            params,
        )))
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn file_cmd(&self, request: Request) -> VfsResult<Response> {
        let vp = self.scoped(request.path())?;
        let target = request.target().map(|t| self.scoped(t)).transpose()?;
        let fs_path = self.fs.resolve_path(&vp)?;
        let fs_target = target
            .as_deref()
            .map(|t| self.fs.resolve_path(t))
            .transpose()?;
        debug!(method = request.method(), source = %vp, target = ?target, "file command");

        match (request, target, fs_target) {
            (Request::SetStat { attrs, .. }, _, _) => self.set_stat(&vp, &fs_path, &attrs).await?,
            (Request::Rename { .. }, Some(target), Some(fs_target)) => {
                self.rename(&vp, &target, &fs_path, &fs_target).await?
            }
            (Request::Symlink { .. }, Some(link), Some(fs_link)) => {
                self.symlink(&vp, &link, &fs_path, &fs_link).await?
            }
            (Request::Rmdir { .. }, _, _) => self.remove_dir(&vp, &fs_path).await?,
            (Request::Mkdir { .. }, _, _) => self.create_dir(&vp, &fs_path).await?,
            (Request::Remove { .. }, _, _) => self.remove_file(&vp, &fs_path).await?,
            (other, _, _) => {
                return Err(VfsError::unsupported(format!("{} command", other.method())));
            }
        }
        Ok(Response::Ok)
    }

    async fn set_stat(&self, vp: &str, fs_path: &Path, attrs: &SetAttr) -> VfsResult<()> {
        let perms_dir = match self.fs.lstat(fs_path).await {
            Ok(attr) if attr.is_dir() => parent(vp),
            _ => vp.to_string(),
        };
        if let Some(mode) = attrs.perm {
            self.require(Permission::Chmod, &perms_dir, vp)?;
            self.fs
                .chmod(fs_path, mode)
                .await
                .inspect_err(|e| warn!(path = %vp, error = %e, "failed to chmod"))?;
        }
        if let Some((uid, gid)) = attrs.owner {
            self.require(Permission::Chown, &perms_dir, vp)?;
            self.fs
                .chown(fs_path, Some(uid), Some(gid))
                .await
                .inspect_err(|e| warn!(path = %vp, error = %e, "failed to chown"))?;
        }
        if let Some((atime, mtime)) = attrs.times {
            self.require(Permission::Chtimes, &perms_dir, vp)?;
            self.fs
                .chtimes(fs_path, atime, mtime)
                .await
                .inspect_err(|e| warn!(path = %vp, error = %e, "failed to chtimes"))?;
        }
        if let Some(size) = attrs.size {
            self.require(Permission::Overwrite, &perms_dir, vp)?;
            self.truncate_file(vp, fs_path, size)
                .await
                .inspect_err(|e| warn!(path = %vp, error = %e, "failed to truncate"))?;
        }
        Ok(())
    }

    /// Truncate through an open upload when there is one, on disk otherwise.
    async fn truncate_file(&self, vp: &str, fs_path: &Path, size: u64) -> VfsResult<()> {
        let open = self
            .transfers
            .iter()
            .find(|t| t.direction() == TransferDirection::Upload && t.fs_path() == fs_path)
            .map(|t| t.value().clone());
        let initial_size = match open {
            Some(transfer) => transfer.truncate(size).await?,
            None => {
                let attr = self.fs.stat(fs_path).await?;
                self.fs.truncate(fs_path, size).await?;
                attr.size
            }
        };
        if self.fs.is_local_or_proxied() {
            let diff = initial_size as i64 - size as i64;
            self.quota.update_usage(&self.user, vp, 0, -diff).await;
        }
        Ok(())
    }

    fn is_rename_permitted(&self, source: &str, target: &str, attr: &FileAttr) -> bool {
        if source == "/" || self.user.is_virtual_folder(source) || self.user.is_virtual_folder(target) {
            return false;
        }
        if attr.is_dir()
            && (self.user.has_virtual_folders_inside(source) || self.user.has_virtual_folders_inside(target))
        {
            return false;
        }
        if attr.is_file() && (!self.user.is_file_allowed(source) || !self.user.is_file_allowed(target)) {
            return false;
        }
        let (source_dir, target_dir) = (parent(source), parent(target));
        if self.user.has_perm(Permission::Rename, &source_dir) && self.user.has_perm(Permission::Rename, &target_dir) {
            return true;
        }
        // Without rename, a move is a delete plus a create.
        if !self.user.has_perm(Permission::Delete, &source_dir) {
            return false;
        }
        if attr.is_dir() {
            self.user.has_perm(Permission::CreateDirs, &target_dir)
        } else if attr.is_symlink() {
            self.user.has_perm(Permission::CreateSymlinks, &target_dir)
        } else {
            self.user.has_perm(Permission::Upload, &target_dir)
        }
    }

    async fn rename(&self, source: &str, target: &str, fs_source: &Path, fs_target: &Path) -> VfsResult<()> {
        if self.is_mapped_path(fs_source).await || self.is_mapped_path(fs_target).await {
            warn!(from = source, to = target, "renaming a directory mapped as virtual folder is not allowed");
            return Err(VfsError::permission_denied(source));
        }
        let attr = self.fs.lstat(fs_source).await?;
        if !self.is_rename_permitted(source, target, &attr) {
            return Err(VfsError::permission_denied(source));
        }

        let mut replaced_size = None;
        if let Ok(existing) = self.fs.lstat(fs_target).await {
            if existing.is_dir() {
                warn!(from = source, to = target, "attempted to rename over an existing directory");
                return Err(VfsError::unsupported("rename over a directory"));
            }
            self.require(Permission::Overwrite, &parent(target), target)?;
            replaced_size = Some(existing.size);
        }

        if !self
            .quota
            .has_space_for_rename(&self.user, self.fs.as_ref(), source, target, replaced_size, fs_source)
            .await
        {
            info!(from = source, to = target, "denying rename due to quota limits");
            return Err(VfsError::QuotaExceeded);
        }
        self.fs
            .rename(fs_source, fs_target)
            .await
            .inspect_err(|e| warn!(from = source, to = target, error = %e, "failed to rename"))?;
        if let Err(e) = self
            .quota
            .update_after_rename(&self.user, self.fs.as_ref(), source, target, fs_target, replaced_size)
            .await
        {
            warn!(from = source, to = target, error = %e, "unable to update quota after rename");
        }
        Ok(())
    }

    async fn symlink(&self, target: &str, link: &str, fs_target: &Path, fs_link: &Path) -> VfsResult<()> {
        if target == "/" {
            warn!("symlinking the root directory is not allowed");
            return Err(VfsError::permission_denied(target));
        }
        if self.user.is_virtual_folder(link) {
            return Err(VfsError::permission_denied(link));
        }
        self.require(Permission::CreateSymlinks, &parent(link), link)?;
        if self.is_cross_folders(target, link) {
            warn!(from = target, to = link, "cross folder symlink is not supported");
            return Err(VfsError::permission_denied(link));
        }
        if self.is_mapped_path(fs_target).await || self.is_mapped_path(fs_link).await {
            return Err(VfsError::permission_denied(link));
        }
        self.fs
            .symlink(fs_target, fs_link)
            .await
            .inspect_err(|e| warn!(from = target, to = link, error = %e, "failed to create symlink"))
    }

    async fn remove_dir(&self, vp: &str, fs_path: &Path) -> VfsResult<()> {
        if vp == "/"
            || self.user.is_virtual_folder(vp)
            || self.user.has_virtual_folders_inside(vp)
            || self.is_mapped_path(fs_path).await
        {
            warn!(path = vp, "removing this directory is not allowed");
            return Err(VfsError::permission_denied(vp));
        }
        self.require(Permission::Delete, &parent(vp), vp)?;
        let attr = self.fs.lstat(fs_path).await?;
        if !attr.is_dir() {
            return Err(VfsError::not_a_directory(vp));
        }
        self.fs
            .remove(fs_path, true)
            .await
            .inspect_err(|e| warn!(path = vp, error = %e, "failed to remove directory"))
    }

    async fn create_dir(&self, vp: &str, fs_path: &Path) -> VfsResult<()> {
        self.require(Permission::CreateDirs, &parent(vp), vp)?;
        self.fs
            .mkdir(fs_path)
            .await
            .inspect_err(|e| warn!(path = vp, error = %e, "failed to create directory"))?;
        self.apply_owner(fs_path).await;
        Ok(())
    }

    async fn remove_file(&self, vp: &str, fs_path: &Path) -> VfsResult<()> {
        let attr = self.fs.lstat(fs_path).await?;
        if attr.is_dir() {
            warn!(path = vp, "cannot remove a directory as a file");
            return Err(VfsError::is_a_directory(vp));
        }
        self.require(Permission::Delete, &parent(vp), vp)?;
        if !self.user.is_file_allowed(vp) {
            warn!(path = vp, "removing file is not allowed");
            return Err(VfsError::permission_denied(vp));
        }
        self.fs
            .remove(fs_path, false)
            .await
            .inspect_err(|e| warn!(path = vp, error = %e, "failed to remove file"))?;
        if !attr.is_symlink() {
            self.quota
                .update_usage(&self.user, vp, -1, -(attr.size as i64))
                .await;
        }
        Ok(())
    }

    // ========================================================================
    // Listing
    // ========================================================================

    async fn file_list(&self, path: &str) -> VfsResult<Response> {
        let (stripped, in_scope) = self.virtualizer.strip_prefix(path);
        if !in_scope {
            return match self.virtualizer.ancestor_entry(path) {
                Some(name) => self.prefix_ancestor_listing(name).await,
                None => Err(VfsError::not_exist(path)),
            };
        }
        let vp = clean_path(&stripped);
        self.require(Permission::List, &vp, &vp)?;
        let fs_path = self.fs.resolve_path(&vp)?;
        let entries = self
            .fs
            .read_dir(&fs_path)
            .await
            .inspect_err(|e| warn!(path = %vp, error = %e, "error listing directory"))?;
        Ok(Response::Entries(self.user.add_virtual_dirs(entries, &vp)))
    }

    /// The single entry leading from an ancestor of the prefix towards it.
    async fn prefix_ancestor_listing(&self, name: String) -> VfsResult<Response> {
        self.require(Permission::List, "/", "/")?;
        let root = self.fs.resolve_path("/")?;
        let mtime = match self.fs.stat(&root).await {
            Ok(attr) => attr.mtime,
            Err(_) => SystemTime::now(),
        };
        Ok(Response::Entries(vec![DirEntry::new(name, FileAttr::directory(mtime))]))
    }

    async fn stat(&self, path: &str, lstat: bool) -> VfsResult<Response> {
        let vp = self.scoped(path)?;
        self.require(Permission::List, &parent(&vp), &vp)?;
        let fs_path = self.fs.resolve_path(&vp)?;
        let attr = if lstat {
            self.fs.lstat(&fs_path).await?
        } else {
            self.fs.stat(&fs_path).await?
        };
        Ok(Response::Entry(DirEntry::new(file_name(&vp), attr)))
    }

    async fn readlink(&self, path: &str) -> VfsResult<Response> {
        let vp = self.scoped(path)?;
        self.require(Permission::List, &parent(&vp), &vp)?;
        let fs_path = self.fs.resolve_path(&vp)?;
        let fs_target = self
            .fs
            .readlink(&fs_path)
            .await
            .inspect_err(|e| debug!(path = %vp, error = %e, "error reading link"))?;
        let target = self.fs.virtual_path(&fs_target);
        self.require(Permission::List, &parent(&target), &vp)?;
        Ok(Response::Link(self.virtualizer.apply_prefix(&target)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::user::VirtualFolder;
    use crate::vfs::LocalBackend;
    use tempfile::TempDir;

    fn connection(user: User, temp: &TempDir) -> Connection {
        let fs: Arc<dyn Fs> = Arc::new(LocalBackend::new(temp.path()));
        let store = Arc::new(MemoryStore::new());
        store.add_user(user.clone());
        Connection::new(user, fs, QuotaManager::new(store, true), Settings::default())
    }

    #[test]
    fn test_cross_folders() {
        let temp = TempDir::new().unwrap();
        let user = User::new("alice", temp.path())
            .with_virtual_folder(VirtualFolder {
                name: "a".into(),
                virtual_path: "/va".into(),
                ..Default::default()
            })
            .with_virtual_folder(VirtualFolder {
                name: "b".into(),
                virtual_path: "/vb".into(),
                ..Default::default()
            });
        let conn = connection(user, &temp);
        assert!(!conn.is_cross_folders("/x", "/y"));
        assert!(!conn.is_cross_folders("/va/x", "/va/y"));
        assert!(conn.is_cross_folders("/va/x", "/vb/y"));
        assert!(conn.is_cross_folders("/x", "/va/y"));
    }

    #[test]
    fn test_rename_permission_fallback() {
        let temp = TempDir::new().unwrap();
        let user = User::new("alice", temp.path()).with_permissions(
            "/",
            vec![Permission::List, Permission::Delete, Permission::Upload],
        );
        let conn = connection(user, &temp);
        let file = FileAttr::file(1, SystemTime::now());
        let dir = FileAttr::directory(SystemTime::now());
        assert!(conn.is_rename_permitted("/a", "/b", &file));
        // Moving a directory needs create_dirs on the target.
        assert!(!conn.is_rename_permitted("/d", "/e", &dir));
        assert!(!conn.is_rename_permitted("/", "/e", &dir));
    }

    #[tokio::test]
    async fn test_idle_time_and_touch() {
        let temp = TempDir::new().unwrap();
        let conn = connection(User::new("alice", temp.path()), &temp);
        conn.last_activity.store(now_millis() - 5_000, Ordering::Relaxed);
        assert!(conn.idle_time() >= Duration::from_secs(4));
        conn.touch();
        assert!(conn.idle_time() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_scoped_rejects_outside_prefix() {
        let temp = TempDir::new().unwrap();
        let conn = connection(User::new("alice", temp.path()), &temp).with_folder_prefix("/files");
        assert_eq!(conn.scoped("/files/a/../b.txt").unwrap(), "/b.txt");
        assert_eq!(conn.scoped("/files").unwrap(), "/");
        assert!(matches!(conn.scoped("/files1/a"), Err(VfsError::NotExist(_))));
    }
}
