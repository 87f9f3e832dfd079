//! Backend capability traits.
//!
//! The connection layer only ever talks to storage through [`Fs`]; each
//! storage kind (local disk, object store, ...) is one implementing type,
//! selected per session from the user's filesystem configuration.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

use super::types::{DirEntry, FileAttr, OpenFlags};
use super::VfsResult;
use crate::config::FilesystemProvider;

/// An open backend file.
///
/// Offsets are explicit on every call; the transfer layer serializes
/// access to one handle.
#[async_trait]
pub trait BackendFile: Send + Sync {
    /// Read up to `len` bytes at `offset`. An empty result means EOF.
    async fn read_at(&mut self, offset: u64, len: u32) -> VfsResult<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes written.
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> VfsResult<usize>;

    /// Truncate an open file.
    async fn truncate(&mut self, _size: u64) -> VfsResult<()> {
        Err(super::VfsError::unsupported("truncate on open handle"))
    }

    /// Flush and finalize the file. For object stores this commits the upload.
    async fn close(&mut self) -> VfsResult<()>;

    /// Give up on the file after a failed transfer.
    ///
    /// Returns true when bytes already written remain persisted (local
    /// disk), false when the backend discards the partial upload.
    async fn abort(&mut self) -> VfsResult<bool>;
}

/// A freshly opened backend file plus the token that cancels its
/// in-flight remote calls.
pub struct OpenedFile {
    pub file: Box<dyn BackendFile>,
    pub cancel: CancellationToken,
}

impl OpenedFile {
    pub fn new(file: Box<dyn BackendFile>) -> Self {
        Self {
            file,
            cancel: CancellationToken::new(),
        }
    }
}

impl std::fmt::Debug for OpenedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedFile")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Filesystem capability surface consumed by the connection layer.
///
/// Paths given to every method except [`Fs::resolve_path`] are the
/// backend-native paths that `resolve_path` produced.
#[async_trait]
pub trait Fs: Send + Sync {
    // ========================================================================
    // Identity & path mapping
    // ========================================================================

    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Which provider this backend serves.
    fn provider(&self) -> FilesystemProvider;

    /// Map a cleaned virtual path to the backend-native path.
    ///
    /// Fails with `PathInvalid` when the result would escape the backend's
    /// confinement root.
    fn resolve_path(&self, virtual_path: &str) -> VfsResult<PathBuf>;

    /// Inverse of [`Fs::resolve_path`]; paths outside the root map to `/`.
    fn virtual_path(&self, fs_path: &Path) -> String;

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Attributes without following a final symlink.
    async fn lstat(&self, path: &Path) -> VfsResult<FileAttr>;

    /// Attributes following symlinks.
    async fn stat(&self, path: &Path) -> VfsResult<FileAttr>;

    /// Directory entries, sorted by name.
    async fn read_dir(&self, path: &Path) -> VfsResult<Vec<DirEntry>>;

    /// Target of a symlink, as a backend-native path.
    async fn readlink(&self, path: &Path) -> VfsResult<PathBuf>;

    // ========================================================================
    // Data
    // ========================================================================

    /// Open for reading starting at `offset`.
    async fn open(&self, path: &Path, offset: u64) -> VfsResult<OpenedFile>;

    /// Open for writing; creates the file when `flags.create` is set.
    async fn create(&self, path: &Path, flags: OpenFlags) -> VfsResult<OpenedFile>;

    // ========================================================================
    // Namespace changes
    // ========================================================================

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()>;

    /// Remove a file (`is_dir = false`) or an empty directory.
    async fn remove(&self, path: &Path, is_dir: bool) -> VfsResult<()>;

    async fn mkdir(&self, path: &Path) -> VfsResult<()>;

    /// Create a symlink at `link` pointing to `target`.
    async fn symlink(&self, target: &Path, link: &Path) -> VfsResult<()>;

    // ========================================================================
    // Attribute changes
    // ========================================================================

    async fn chmod(&self, path: &Path, mode: u32) -> VfsResult<()>;

    /// Change ownership; `None` leaves that id unchanged.
    async fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> VfsResult<()>;

    async fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> VfsResult<()>;

    async fn truncate(&self, path: &Path, size: u64) -> VfsResult<()>;

    // ========================================================================
    // Capabilities
    // ========================================================================

    /// Whether uploads can go to a temporary sibling and be renamed on close.
    fn is_atomic_upload_supported(&self) -> bool;

    /// Temporary sibling used for atomic uploads of `path`.
    fn atomic_upload_path(&self, path: &Path) -> PathBuf;

    /// Local disk or a proxied remote filesystem, which support random
    /// access writes, read-while-write and truncation.
    fn is_local_or_proxied(&self) -> bool;

    /// Whether an upload may append to an existing file.
    fn is_upload_resume_supported(&self) -> bool;

    /// Release backend resources at session end.
    async fn close(&self) -> VfsResult<()> {
        Ok(())
    }

    // ========================================================================
    // Convenience methods (default implementations)
    // ========================================================================

    /// Total file count and byte size below a directory.
    async fn dir_usage(&self, path: &Path) -> VfsResult<(u64, u64)> {
        let mut files = 0u64;
        let mut size = 0u64;
        let mut pending = vec![path.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in self.read_dir(&dir).await? {
                let child = dir.join(&entry.name);
                if entry.attr.is_dir() {
                    pending.push(child);
                } else if entry.attr.is_file() {
                    files += 1;
                    size += entry.attr.size;
                }
            }
        }
        Ok((files, size))
    }
}
