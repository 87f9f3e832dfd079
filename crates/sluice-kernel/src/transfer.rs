//! Upload and download lifecycle.
//!
//! A [`Transfer`] owns one open backend file from the moment a read or
//! write request is accepted until the client closes the handle or the
//! connection goes away. Closing settles everything the transfer touched:
//! atomic uploads are renamed into place (or discarded), partial files
//! left by a quota violation are removed, and the resulting size change is
//! charged exactly once.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::quota::QuotaManager;
use crate::user::User;
use crate::vfs::{BackendFile, Fs, OpenedFile, VfsError, VfsResult};

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum TransferDirection {
    Download,
    Upload,
}

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransferPhase {
    Opened,
    Writing,
    Committed,
    Aborted,
}

/// Why reads on an upload handle are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadBlock {
    /// The user lacks the download permission.
    PermissionDenied,
    /// The backend cannot read back a file being written.
    Unsupported,
}

/// Error recorded against a transfer, reported again on close.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Recorded {
    QuotaExceeded,
    Failed(String),
}

impl Recorded {
    fn from_error(e: &VfsError) -> Self {
        match e {
            VfsError::QuotaExceeded => Recorded::QuotaExceeded,
            other => Recorded::Failed(other.to_string()),
        }
    }

    fn into_error(self) -> VfsError {
        match self {
            Recorded::QuotaExceeded => VfsError::QuotaExceeded,
            Recorded::Failed(msg) => VfsError::other(msg),
        }
    }
}

#[derive(Debug)]
struct TransferState {
    bytes: u64,
    min_write_offset: u64,
    initial_size: u64,
    max_write_size: Option<u64>,
    error: Option<Recorded>,
    phase: TransferPhase,
}

/// Everything needed to start an upload.
#[derive(Debug, Clone)]
pub struct UploadParams {
    /// Final backend path.
    pub fs_path: PathBuf,
    /// Path actually written: the atomic temp sibling, or `fs_path`.
    pub effective_path: PathBuf,
    pub virtual_path: String,
    pub min_write_offset: u64,
    pub initial_size: u64,
    pub max_write_size: Option<u64>,
    pub is_new_file: bool,
    /// The existing file was renamed to `effective_path`; a failed upload
    /// renames it back.
    pub original_moved: bool,
    /// Close replaces the whole file, so a smaller result gives bytes back.
    pub replaces_file: bool,
    pub read_block: Option<ReadBlock>,
}

/// One in-flight upload or download.
pub struct Transfer {
    id: u64,
    direction: TransferDirection,
    fs: Arc<dyn Fs>,
    user: Arc<User>,
    quota: QuotaManager,
    fs_path: PathBuf,
    effective_path: PathBuf,
    virtual_path: String,
    is_new_file: bool,
    original_moved: bool,
    replaces_file: bool,
    read_block: Option<ReadBlock>,
    file: tokio::sync::Mutex<Box<dyn BackendFile>>,
    cancel: CancellationToken,
    state: Mutex<TransferState>,
    started: Instant,
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("virtual_path", &self.virtual_path)
            .field("phase", &self.state.lock().phase)
            .finish()
    }
}

impl Transfer {
    /// A download of `fs_path`.
    pub fn download(
        id: u64,
        fs: Arc<dyn Fs>,
        user: Arc<User>,
        quota: QuotaManager,
        opened: OpenedFile,
        fs_path: PathBuf,
        virtual_path: String,
    ) -> Self {
        Self {
            id,
            direction: TransferDirection::Download,
            fs,
            user,
            quota,
            effective_path: fs_path.clone(),
            fs_path,
            virtual_path,
            is_new_file: false,
            original_moved: false,
            replaces_file: false,
            read_block: None,
            file: tokio::sync::Mutex::new(opened.file),
            cancel: opened.cancel,
            state: Mutex::new(TransferState {
                bytes: 0,
                min_write_offset: 0,
                initial_size: 0,
                max_write_size: None,
                error: None,
                phase: TransferPhase::Opened,
            }),
            started: Instant::now(),
        }
    }

    /// An upload described by `params`.
    pub fn upload(
        id: u64,
        fs: Arc<dyn Fs>,
        user: Arc<User>,
        quota: QuotaManager,
        opened: OpenedFile,
        params: UploadParams,
    ) -> Self {
        Self {
            id,
            direction: TransferDirection::Upload,
            fs,
            user,
            quota,
            fs_path: params.fs_path,
            effective_path: params.effective_path,
            virtual_path: params.virtual_path,
            is_new_file: params.is_new_file,
            original_moved: params.original_moved,
            replaces_file: params.replaces_file,
            read_block: params.read_block,
            file: tokio::sync::Mutex::new(opened.file),
            cancel: opened.cancel,
            state: Mutex::new(TransferState {
                bytes: 0,
                min_write_offset: params.min_write_offset,
                initial_size: params.initial_size,
                max_write_size: params.max_write_size,
                error: None,
                phase: TransferPhase::Opened,
            }),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn fs_path(&self) -> &Path {
        &self.fs_path
    }

    pub fn effective_path(&self) -> &Path {
        &self.effective_path
    }

    pub fn virtual_path(&self) -> &str {
        &self.virtual_path
    }

    pub fn is_new_file(&self) -> bool {
        self.is_new_file
    }

    pub fn phase(&self) -> TransferPhase {
        self.state.lock().phase
    }

    /// Bytes sent (downloads) or received (uploads) so far.
    pub fn bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    pub fn min_write_offset(&self) -> u64 {
        self.state.lock().min_write_offset
    }

    pub fn initial_size(&self) -> u64 {
        self.state.lock().initial_size
    }

    pub fn max_write_size(&self) -> Option<u64> {
        self.state.lock().max_write_size
    }

    fn is_finished(&self) -> bool {
        matches!(self.phase(), TransferPhase::Committed | TransferPhase::Aborted)
    }

    fn record(&self, e: &VfsError) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some(Recorded::from_error(e));
        }
    }

    /// Read up to `len` bytes at `offset`. An empty result means EOF.
    pub async fn read_at(&self, offset: u64, len: u32) -> VfsResult<Vec<u8>> {
        match self.read_block {
            Some(ReadBlock::PermissionDenied) => {
                return Err(VfsError::permission_denied(self.virtual_path.clone()));
            }
            Some(ReadBlock::Unsupported) => {
                return Err(VfsError::unsupported("reading a file being uploaded"));
            }
            None => {}
        }
        if self.is_finished() {
            return Err(VfsError::other("transfer already closed"));
        }
        let mut file = self.file.lock().await;
        let data = match file.read_at(offset, len).await {
            Ok(data) => data,
            Err(e) => {
                self.record(&e);
                return Err(e);
            }
        };
        if self.direction == TransferDirection::Download {
            self.state.lock().bytes += data.len() as u64;
        }
        Ok(data)
    }

    /// Write `data` at `offset`.
    ///
    /// Offsets below the resume point are rejected, and a write that would
    /// carry the upload past its maximum size fails with `QuotaExceeded`
    /// before any byte is written.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> VfsResult<usize> {
        if self.direction != TransferDirection::Upload {
            return Err(VfsError::unsupported("writing to a download"));
        }
        if self.is_finished() {
            return Err(VfsError::other("transfer already closed"));
        }
        {
            let state = self.state.lock();
            if offset < state.min_write_offset {
                let e = VfsError::other(format!(
                    "invalid write offset {offset}, minimum valid value {}",
                    state.min_write_offset
                ));
                drop(state);
                self.record(&e);
                return Err(e);
            }
            if let Some(max) = state.max_write_size {
                if state.bytes + data.len() as u64 > max {
                    drop(state);
                    self.record(&VfsError::QuotaExceeded);
                    return Err(VfsError::QuotaExceeded);
                }
            }
        }

        let mut file = self.file.lock().await;
        let written = match file.write_at(offset, data).await {
            Ok(n) => n,
            Err(e) => {
                self.record(&e);
                return Err(e);
            }
        };
        let mut state = self.state.lock();
        state.bytes += written as u64;
        state.phase = TransferPhase::Writing;
        Ok(written)
    }

    /// Truncate the open file, returning the size the transfer started from.
    ///
    /// The remaining write allowance is adjusted by the bytes given back.
    pub async fn truncate(&self, size: u64) -> VfsResult<u64> {
        let mut file = self.file.lock().await;
        match file.truncate(size).await {
            Ok(()) => {
                let mut state = self.state.lock();
                let previous = state.initial_size;
                state.initial_size = size;
                if let Some(max) = state.max_write_size {
                    let adjusted = max as i64 + previous as i64 - size as i64;
                    state.max_write_size = Some(adjusted.max(0) as u64);
                    state.bytes = 0;
                }
                Ok(previous)
            }
            Err(VfsError::Unsupported(_)) if size == 0 && self.bytes() == 0 => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Close the handle normally.
    pub async fn close(&self) -> VfsResult<()> {
        self.finish(None).await
    }

    /// Abort after a connection loss or other failure.
    ///
    /// Pending remote retries are cancelled; whatever the backend already
    /// persisted is accounted for.
    pub async fn abort(&self, reason: VfsError) -> VfsResult<()> {
        self.cancel.cancel();
        self.finish(Some(reason)).await
    }

    async fn finish(&self, reason: Option<VfsError>) -> VfsResult<()> {
        let mut file = self.file.lock().await;
        if self.is_finished() {
            return Ok(());
        }
        if let Some(reason) = &reason {
            self.record(reason);
        }

        let mut error = self.state.lock().error.take();
        let persisted = if error.is_none() {
            match file.close().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(path = %self.fs_path.display(), error = %e, "unable to close file");
                    error = Some(Recorded::from_error(&e));
                    file.abort().await.unwrap_or(false)
                }
            }
        } else {
            file.abort().await.unwrap_or(false)
        };
        drop(file);

        if self.direction == TransferDirection::Download {
            let bytes = self.bytes();
            self.set_phase(error.is_none());
            info!(
                user = %self.user.username,
                path = %self.virtual_path,
                bytes,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "download finished"
            );
            return error.map_or(Ok(()), |e| Err(e.into_error()));
        }

        let (mut bytes, mut min_write_offset, initial_size) = {
            let state = self.state.lock();
            (state.bytes, state.min_write_offset, state.initial_size)
        };
        let mut num_files: i64 = if self.is_new_file { 1 } else { 0 };
        // Backends that discard failed uploads leave nothing to account for.
        let mut account = error.is_none() || persisted;

        if self.effective_path != self.fs_path {
            if error.is_none() {
                if let Err(e) = self.fs.rename(&self.effective_path, &self.fs_path).await {
                    warn!(
                        from = %self.effective_path.display(),
                        to = %self.fs_path.display(),
                        error = %e,
                        "atomic upload rename failed"
                    );
                    error = Some(Recorded::from_error(&e));
                }
            } else if self.original_moved {
                // Bytes appended before the failure stay, as for a direct write.
                match self.fs.rename(&self.effective_path, &self.fs_path).await {
                    Ok(()) => debug!(path = %self.fs_path.display(), "original file restored after failed upload"),
                    Err(e) => warn!(
                        from = %self.effective_path.display(),
                        to = %self.fs_path.display(),
                        error = %e,
                        "unable to restore original file"
                    ),
                }
            } else {
                if let Err(e) = self.fs.remove(&self.effective_path, false).await {
                    warn!(path = %self.effective_path.display(), error = %e, "unable to remove atomic upload file");
                }
                account = false;
            }
        } else if error == Some(Recorded::QuotaExceeded) {
            let removed = self.fs.remove(&self.effective_path, false).await;
            if removed.is_ok() {
                num_files -= 1;
                bytes = 0;
                min_write_offset = 0;
            }
            warn!(
                path = %self.effective_path.display(),
                removed = removed.is_ok(),
                "upload denied due to space limit, partial file removed"
            );
        }

        if account {
            let file_size = bytes + min_write_offset;
            let size_diff = file_size as i64 - initial_size as i64;
            if num_files != 0 || size_diff > 0 || (size_diff < 0 && self.replaces_file) {
                self.quota
                    .update_usage(&self.user, &self.virtual_path, num_files, size_diff)
                    .await;
            }
        } else {
            debug!(path = %self.virtual_path, "failed upload persisted nothing, usage unchanged");
        }

        self.set_phase(error.is_none());
        info!(
            user = %self.user.username,
            path = %self.virtual_path,
            bytes,
            ok = error.is_none(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "upload finished"
        );
        error.map_or(Ok(()), |e| Err(e.into_error()))
    }

    fn set_phase(&self, ok: bool) {
        self.state.lock().phase = if ok {
            TransferPhase::Committed
        } else {
            TransferPhase::Aborted
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Usage, UserStore};
    use crate::vfs::LocalBackend;
    use crate::vfs::types::OpenFlags;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        fs: Arc<dyn Fs>,
        store: Arc<MemoryStore>,
        quota: QuotaManager,
        user: Arc<User>,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let fs: Arc<dyn Fs> = Arc::new(LocalBackend::new(temp.path()));
        let store = Arc::new(MemoryStore::new());
        let user = User::new("alice", temp.path());
        store.add_user(user.clone());
        let quota = QuotaManager::new(store.clone(), true);
        Fixture {
            _temp: temp,
            fs,
            store,
            quota,
            user: Arc::new(user),
        }
    }

    async fn upload(f: &Fixture, virtual_path: &str, atomic: bool, max: Option<u64>) -> Transfer {
        let fs_path = f.fs.resolve_path(virtual_path).unwrap();
        let effective_path = if atomic {
            f.fs.atomic_upload_path(&fs_path)
        } else {
            fs_path.clone()
        };
        let opened = f.fs.create(&effective_path, OpenFlags::create_truncate()).await.unwrap();
        Transfer::upload(
            1,
            f.fs.clone(),
            f.user.clone(),
            f.quota.clone(),
            opened,
            UploadParams {
                fs_path,
                effective_path,
                virtual_path: virtual_path.to_string(),
                min_write_offset: 0,
                initial_size: 0,
                max_write_size: max,
                is_new_file: true,
                original_moved: false,
                replaces_file: false,
                read_block: None,
            },
        )
    }

    #[tokio::test]
    async fn test_upload_commits_quota() {
        let f = fixture();
        let t = upload(&f, "/a.bin", false, None).await;
        t.write_at(0, b"hello").await.unwrap();
        assert_eq!(t.phase(), TransferPhase::Writing);
        t.close().await.unwrap();
        assert_eq!(t.phase(), TransferPhase::Committed);
        assert_eq!(f.store.used_quota("alice").await.unwrap(), Usage { files: 1, size: 5 });

        // Closing twice charges nothing more.
        t.close().await.unwrap();
        assert_eq!(f.store.used_quota("alice").await.unwrap(), Usage { files: 1, size: 5 });
    }

    #[tokio::test]
    async fn test_atomic_upload_renamed_on_close() {
        let f = fixture();
        let t = upload(&f, "/b.bin", true, None).await;
        assert_ne!(t.effective_path(), t.fs_path());
        t.write_at(0, b"data").await.unwrap();
        assert!(!t.fs_path().exists());
        t.close().await.unwrap();
        assert_eq!(std::fs::read(t.fs_path()).unwrap(), b"data");
        assert!(!t.effective_path().exists());
    }

    #[tokio::test]
    async fn test_atomic_upload_discarded_on_abort() {
        let f = fixture();
        let t = upload(&f, "/c.bin", true, None).await;
        t.write_at(0, b"partial").await.unwrap();
        assert!(t.abort(VfsError::other("connection lost")).await.is_err());
        assert_eq!(t.phase(), TransferPhase::Aborted);
        assert!(!t.effective_path().exists());
        assert!(!t.fs_path().exists());
        assert_eq!(f.store.used_quota("alice").await.unwrap(), Usage::default());
    }

    #[tokio::test]
    async fn test_direct_abort_keeps_flushed_bytes() {
        let f = fixture();
        let t = upload(&f, "/d.bin", false, None).await;
        t.write_at(0, b"12345").await.unwrap();
        assert!(t.abort(VfsError::other("connection lost")).await.is_err());
        assert!(t.fs_path().exists());
        assert_eq!(f.store.used_quota("alice").await.unwrap(), Usage { files: 1, size: 5 });
    }

    #[tokio::test]
    async fn test_write_past_max_removes_partial_file() {
        let f = fixture();
        let t = upload(&f, "/e.bin", false, Some(8)).await;
        t.write_at(0, b"12345").await.unwrap();
        assert!(matches!(t.write_at(5, b"6789").await, Err(VfsError::QuotaExceeded)));
        assert!(matches!(t.close().await, Err(VfsError::QuotaExceeded)));
        assert!(!t.fs_path().exists());
        assert_eq!(f.store.used_quota("alice").await.unwrap(), Usage::default());
    }

    #[tokio::test]
    async fn test_write_below_min_offset_rejected() {
        let f = fixture();
        let fs_path = f.fs.resolve_path("/r.bin").unwrap();
        std::fs::write(&fs_path, b"abc").unwrap();
        let opened = f.fs.create(&fs_path, OpenFlags::append()).await.unwrap();
        let t = Transfer::upload(
            2,
            f.fs.clone(),
            f.user.clone(),
            f.quota.clone(),
            opened,
            UploadParams {
                fs_path: fs_path.clone(),
                effective_path: fs_path.clone(),
                virtual_path: "/r.bin".into(),
                min_write_offset: 3,
                initial_size: 3,
                max_write_size: None,
                is_new_file: false,
                original_moved: false,
                replaces_file: false,
                read_block: Some(ReadBlock::PermissionDenied),
            },
        );
        assert!(t.write_at(0, b"x").await.is_err());
        assert!(matches!(t.read_at(0, 1).await, Err(VfsError::PermissionDenied(_))));
        assert_eq!(t.write_at(3, b"def").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_resume_appends_and_charges_delta() {
        let f = fixture();
        let fs_path = f.fs.resolve_path("/s.bin").unwrap();
        std::fs::write(&fs_path, b"abc").unwrap();
        let opened = f.fs.create(&fs_path, OpenFlags::append()).await.unwrap();
        let t = Transfer::upload(
            3,
            f.fs.clone(),
            f.user.clone(),
            f.quota.clone(),
            opened,
            UploadParams {
                fs_path: fs_path.clone(),
                effective_path: fs_path.clone(),
                virtual_path: "/s.bin".into(),
                min_write_offset: 3,
                initial_size: 3,
                max_write_size: None,
                is_new_file: false,
                original_moved: false,
                replaces_file: false,
                read_block: None,
            },
        );
        t.write_at(3, b"def").await.unwrap();
        t.close().await.unwrap();
        assert_eq!(std::fs::read(&fs_path).unwrap(), b"abcdef");
        assert_eq!(f.store.used_quota("alice").await.unwrap(), Usage { files: 0, size: 3 });
    }

    #[tokio::test]
    async fn test_truncate_open_upload() {
        let f = fixture();
        let t = upload(&f, "/t.bin", false, Some(100)).await;
        t.write_at(0, b"0123456789").await.unwrap();
        assert_eq!(t.truncate(0).await.unwrap(), 0);
        assert_eq!(t.bytes(), 0);
        assert_eq!(t.max_write_size(), Some(100));
    }

    #[tokio::test]
    async fn test_download_counts_bytes() {
        let f = fixture();
        let fs_path = f.fs.resolve_path("/dl.txt").unwrap();
        std::fs::write(&fs_path, b"download me").unwrap();
        let opened = f.fs.open(&fs_path, 0).await.unwrap();
        let t = Transfer::download(
            4,
            f.fs.clone(),
            f.user.clone(),
            f.quota.clone(),
            opened,
            fs_path,
            "/dl.txt".into(),
        );
        assert_eq!(t.read_at(0, 8).await.unwrap(), b"download");
        assert_eq!(t.read_at(8, 8).await.unwrap(), b" me");
        assert!(t.write_at(0, b"x").await.is_err());
        t.close().await.unwrap();
        assert_eq!(t.bytes(), 11);
        assert_eq!(f.store.used_quota("alice").await.unwrap(), Usage::default());
    }
}
