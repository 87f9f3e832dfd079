//! Object-store backend (S3, GCS, Azure Blob).
//!
//! Object stores have no real directories, no random-access writes and no
//! symlinks. Directories are modelled as zero-byte `dir/` marker objects
//! plus common prefixes; uploads stream sequentially into a multipart
//! upload that is committed on close and discarded on abort. Every remote
//! call goes through the configured [`RetryPolicy`].

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{FilesystemConfig, FilesystemProvider};
use crate::resolver::{prefix_root, resolve_key};
use crate::retry::{RetryPolicy, run_with_retry};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::{BackendFile, Fs, OpenedFile};
use crate::vfs::path::clean_path;
use crate::vfs::types::{DirEntry, FileAttr, OpenFlags};

/// Default multipart chunk size.
pub const DEFAULT_PART_SIZE: usize = 5 * 1024 * 1024;

const AWS_REQUEST_ERROR: &str = "RequestError";
const AWS_SEND_REQUEST_FAILED: &str = "send request failed";
const AWS_CLIENT_DISCONNECTED: &str = "ClientDisconnected";
const AWS_SERVICE_UNAVAILABLE: &str = "ServiceUnavailable";

/// Error reported by an object-store driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("{code}: {message}")]
    Service {
        code: String,
        message: String,
        status: Option<u16>,
    },
}

impl ObjectError {
    /// A service error without an HTTP status.
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }

    /// Transient network failure: service unavailable, client disconnected,
    /// or a request that could not be sent at all.
    pub fn is_connection_error(&self) -> bool {
        match self {
            ObjectError::NotFound(_) => false,
            ObjectError::Service { code, message, .. } => {
                code == AWS_SERVICE_UNAVAILABLE
                    || code == AWS_CLIENT_DISCONNECTED
                    || (code == AWS_REQUEST_ERROR && message == AWS_SEND_REQUEST_FAILED)
            }
        }
    }
}

/// Object metadata as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
    /// User-settable modification time (GCS `customTime`).
    pub custom_time: Option<SystemTime>,
}

impl ObjectMeta {
    /// The time to report as mtime.
    ///
    /// A zero-valued custom time is treated as absent.
    pub fn effective_mtime(&self) -> SystemTime {
        match self.custom_time {
            Some(t) if t > UNIX_EPOCH => t,
            _ => self.last_modified,
        }
    }
}

/// One page of a delimited listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectListing {
    pub objects: Vec<ObjectMeta>,
    /// Common prefixes, each ending with the delimiter.
    pub prefixes: Vec<String>,
}

/// Options attached to a new upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    pub custom_time: Option<SystemTime>,
}

/// Driver surface of an object-store SDK.
///
/// Keys never start with `/`.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn head_object(&self, key: &str) -> Result<ObjectMeta, ObjectError>;

    async fn get_object_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>, ObjectError>;

    async fn put_object(&self, key: &str, data: Vec<u8>) -> Result<(), ObjectError>;

    /// Start a multipart upload, returning its id.
    async fn create_multipart_upload(
        &self,
        key: &str,
        options: &UploadOptions,
    ) -> Result<String, ObjectError>;

    async fn upload_part(&self, upload_id: &str, part_number: u32, data: Vec<u8>) -> Result<(), ObjectError>;

    async fn complete_multipart_upload(&self, upload_id: &str) -> Result<(), ObjectError>;

    async fn abort_multipart_upload(&self, upload_id: &str) -> Result<(), ObjectError>;

    async fn list_objects(
        &self,
        prefix: &str,
        delimiter: Option<char>,
        max_keys: Option<usize>,
    ) -> Result<ObjectListing, ObjectError>;

    async fn delete_object(&self, key: &str) -> Result<(), ObjectError>;

    async fn copy_object(&self, from: &str, to: &str) -> Result<(), ObjectError>;
}

/// Shared plumbing between the backend and its open files.
#[derive(Clone)]
struct Remote {
    client: Arc<dyn ObjectClient>,
    retry: Arc<dyn RetryPolicy>,
}

impl Remote {
    async fn head(&self, key: &str, cancel: &CancellationToken) -> Result<ObjectMeta, ObjectError> {
        run_with_retry(self.retry.as_ref(), "HeadObject", cancel, || {
            self.client.head_object(key)
        })
        .await
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<char>,
        max_keys: Option<usize>,
        cancel: &CancellationToken,
    ) -> VfsResult<ObjectListing> {
        run_with_retry(self.retry.as_ref(), "ListObjectsV2", cancel, || {
            self.client.list_objects(prefix, delimiter, max_keys)
        })
        .await
        .map_err(|e| VfsError::backend("ListObjectsV2", e))
    }

    async fn put(&self, key: &str, cancel: &CancellationToken) -> VfsResult<()> {
        run_with_retry(self.retry.as_ref(), "PutObject", cancel, || {
            self.client.put_object(key, Vec::new())
        })
        .await
        .map_err(|e| VfsError::backend("PutObject", e))
    }

    async fn delete(&self, key: &str, cancel: &CancellationToken) -> VfsResult<()> {
        run_with_retry(self.retry.as_ref(), "DeleteObject", cancel, || {
            self.client.delete_object(key)
        })
        .await
        .map_err(|e| VfsError::backend("DeleteObject", e))
    }

    async fn copy(&self, from: &str, to: &str, cancel: &CancellationToken) -> VfsResult<()> {
        run_with_retry(self.retry.as_ref(), "CopyObject", cancel, || {
            self.client.copy_object(from, to)
        })
        .await
        .map_err(|e| VfsError::backend("CopyObject", e))
    }
}

/// Object-store implementation of [`Fs`].
pub struct ObjectStoreBackend {
    provider: FilesystemProvider,
    key_prefix: String,
    root: String,
    remote: Remote,
    part_size: usize,
    session: CancellationToken,
}

impl ObjectStoreBackend {
    /// Build a backend for an object-store filesystem configuration.
    pub fn new(
        fs: &FilesystemConfig,
        client: Arc<dyn ObjectClient>,
        retry: Arc<dyn RetryPolicy>,
    ) -> VfsResult<Self> {
        let key_prefix = fs
            .key_prefix()
            .ok_or_else(|| VfsError::unsupported(format!("{} is not an object store", fs.provider)))?
            .to_string();
        Ok(Self {
            provider: fs.provider,
            root: prefix_root(&key_prefix),
            key_prefix,
            remote: Remote { client, retry },
            part_size: DEFAULT_PART_SIZE,
            session: CancellationToken::new(),
        })
    }

    /// Builder: multipart chunk size.
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    fn object_key(path: &Path) -> String {
        path.to_string_lossy().trim_start_matches('/').to_string()
    }

    fn dir_prefix(key: &str) -> String {
        if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        }
    }

    fn is_root(&self, path: &Path) -> bool {
        clean_path(&path.to_string_lossy()) == self.root
    }

    /// True if anything other than the directory's own marker lives below it.
    async fn has_contents(&self, prefix: &str) -> VfsResult<bool> {
        let listing = self
            .remote
            .list(prefix, Some('/'), Some(2), &self.session)
            .await?;
        Ok(!listing.prefixes.is_empty() || listing.objects.iter().any(|o| o.key != prefix))
    }

    async fn stat_key(&self, path: &Path) -> VfsResult<FileAttr> {
        if self.is_root(path) {
            return Ok(FileAttr::directory(UNIX_EPOCH));
        }
        let key = Self::object_key(path);
        match self.remote.head(&key, &self.session).await {
            Ok(meta) => Ok(FileAttr::file(meta.size, meta.effective_mtime())),
            Err(ObjectError::NotFound(_)) => {
                let prefix = Self::dir_prefix(&key);
                let listing = self
                    .remote
                    .list(&prefix, None, Some(1), &self.session)
                    .await?;
                match listing.objects.first() {
                    Some(marker) => Ok(FileAttr::directory(marker.effective_mtime())),
                    None => Err(VfsError::not_exist(path.display().to_string())),
                }
            }
            Err(e) => Err(VfsError::backend("HeadObject", e)),
        }
    }
}

#[async_trait]
impl Fs for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        match self.provider {
            FilesystemProvider::Gcs => "gcsfs",
            FilesystemProvider::Azure => "azblobfs",
            _ => "s3fs",
        }
    }

    fn provider(&self) -> FilesystemProvider {
        self.provider
    }

    fn resolve_path(&self, virtual_path: &str) -> VfsResult<PathBuf> {
        let cleaned = clean_path(virtual_path);
        if cleaned == "/" {
            return Ok(PathBuf::from(&self.root));
        }
        resolve_key(&self.key_prefix, &cleaned).map(PathBuf::from)
    }

    fn virtual_path(&self, fs_path: &Path) -> String {
        let cleaned = clean_path(&fs_path.to_string_lossy());
        if self.root == "/" {
            return cleaned;
        }
        match cleaned.strip_prefix(&self.root) {
            Some("") => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => "/".to_string(),
        }
    }

    async fn lstat(&self, path: &Path) -> VfsResult<FileAttr> {
        self.stat_key(path).await
    }

    async fn stat(&self, path: &Path) -> VfsResult<FileAttr> {
        self.stat_key(path).await
    }

    async fn read_dir(&self, path: &Path) -> VfsResult<Vec<DirEntry>> {
        let prefix = Self::dir_prefix(&Self::object_key(path));
        let listing = self
            .remote
            .list(&prefix, Some('/'), None, &self.session)
            .await?;

        let mut entries = Vec::new();
        for object in &listing.objects {
            if object.key == prefix {
                continue;
            }
            let name = object.key[prefix.len()..].to_string();
            entries.push(DirEntry::new(
                name,
                FileAttr::file(object.size, object.effective_mtime()),
            ));
        }
        for common in &listing.prefixes {
            let name = common[prefix.len()..].trim_end_matches('/').to_string();
            if name.is_empty() {
                continue;
            }
            entries.push(DirEntry::new(name, FileAttr::directory(UNIX_EPOCH)));
        }

        if entries.is_empty() && listing.objects.is_empty() && !self.is_root(path) {
            let attr = self.stat_key(path).await?;
            if !attr.is_dir() {
                return Err(VfsError::not_a_directory(path.display().to_string()));
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn readlink(&self, _path: &Path) -> VfsResult<PathBuf> {
        Err(VfsError::unsupported("readlink on object store"))
    }

    async fn open(&self, path: &Path, _offset: u64) -> VfsResult<OpenedFile> {
        let key = Self::object_key(path);
        let cancel = self.session.child_token();
        let meta = self
            .remote
            .head(&key, &cancel)
            .await
            .map_err(|e| VfsError::backend("HeadObject", e))?;
        let reader = ObjectReader {
            remote: self.remote.clone(),
            key,
            size: meta.size,
            cancel: cancel.clone(),
        };
        Ok(OpenedFile {
            file: Box::new(reader),
            cancel,
        })
    }

    async fn create(&self, path: &Path, _flags: OpenFlags) -> VfsResult<OpenedFile> {
        let key = Self::object_key(path);
        let cancel = self.session.child_token();
        let options = UploadOptions {
            custom_time: (self.provider == FilesystemProvider::Gcs).then(SystemTime::now),
        };
        let upload_id = run_with_retry(
            self.remote.retry.as_ref(),
            "CreateMultipartUpload",
            &cancel,
            || self.remote.client.create_multipart_upload(&key, &options),
        )
        .await
        .map_err(|e| VfsError::backend("CreateMultipartUpload", e))?;
        debug!(key = %key, upload_id = %upload_id, "multipart upload started");

        let writer = ObjectWriter {
            remote: self.remote.clone(),
            key,
            upload_id,
            buffer: Vec::new(),
            next_offset: 0,
            next_part: 1,
            part_size: self.part_size,
            finished: false,
            cancel: cancel.clone(),
        };
        Ok(OpenedFile {
            file: Box::new(writer),
            cancel,
        })
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        let attr = self.stat_key(from).await?;
        let from_key = Self::object_key(from);
        let to_key = Self::object_key(to);
        if attr.is_dir() {
            let from_prefix = Self::dir_prefix(&from_key);
            if self.has_contents(&from_prefix).await? {
                return Err(VfsError::unsupported("renaming a non-empty directory"));
            }
            self.remote.put(&Self::dir_prefix(&to_key), &self.session).await?;
            return self.remote.delete(&from_prefix, &self.session).await;
        }
        self.remote.copy(&from_key, &to_key, &self.session).await?;
        self.remote.delete(&from_key, &self.session).await
    }

    async fn remove(&self, path: &Path, is_dir: bool) -> VfsResult<()> {
        let key = Self::object_key(path);
        if is_dir {
            let prefix = Self::dir_prefix(&key);
            if self.has_contents(&prefix).await? {
                return Err(VfsError::directory_not_empty(path.display().to_string()));
            }
            return self.remote.delete(&prefix, &self.session).await;
        }
        self.remote.delete(&key, &self.session).await
    }

    async fn mkdir(&self, path: &Path) -> VfsResult<()> {
        match self.stat_key(path).await {
            Ok(_) => Err(VfsError::already_exists(path.display().to_string())),
            Err(e) if e.is_not_exist() => {
                let prefix = Self::dir_prefix(&Self::object_key(path));
                self.remote.put(&prefix, &self.session).await
            }
            Err(e) => Err(e),
        }
    }

    async fn symlink(&self, _target: &Path, _link: &Path) -> VfsResult<()> {
        Err(VfsError::unsupported("symlink on object store"))
    }

    async fn chmod(&self, _path: &Path, _mode: u32) -> VfsResult<()> {
        Err(VfsError::unsupported("chmod on object store"))
    }

    async fn chown(&self, _path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> VfsResult<()> {
        Err(VfsError::unsupported("chown on object store"))
    }

    async fn chtimes(&self, _path: &Path, _atime: SystemTime, _mtime: SystemTime) -> VfsResult<()> {
        Err(VfsError::unsupported("chtimes on object store"))
    }

    async fn truncate(&self, _path: &Path, _size: u64) -> VfsResult<()> {
        Err(VfsError::unsupported("truncate on object store"))
    }

    fn is_atomic_upload_supported(&self) -> bool {
        false
    }

    fn atomic_upload_path(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }

    fn is_local_or_proxied(&self) -> bool {
        false
    }

    fn is_upload_resume_supported(&self) -> bool {
        false
    }

    async fn close(&self) -> VfsResult<()> {
        self.session.cancel();
        Ok(())
    }
}

/// Ranged reader over one object.
struct ObjectReader {
    remote: Remote,
    key: String,
    size: u64,
    cancel: CancellationToken,
}

#[async_trait]
impl BackendFile for ObjectReader {
    async fn read_at(&mut self, offset: u64, len: u32) -> VfsResult<Vec<u8>> {
        if offset >= self.size || len == 0 {
            return Ok(Vec::new());
        }
        let len = u64::from(len).min(self.size - offset);
        let remote = &self.remote;
        let key = &self.key;
        run_with_retry(remote.retry.as_ref(), "GetObject", &self.cancel, || {
            remote.client.get_object_range(key, offset, len)
        })
        .await
        .map_err(|e| VfsError::backend("GetObject", e))
    }

    async fn write_at(&mut self, _offset: u64, _data: &[u8]) -> VfsResult<usize> {
        Err(VfsError::unsupported("write on a download handle"))
    }

    async fn close(&mut self) -> VfsResult<()> {
        Ok(())
    }

    async fn abort(&mut self) -> VfsResult<bool> {
        self.cancel.cancel();
        Ok(true)
    }
}

/// Sequential multipart upload writer.
struct ObjectWriter {
    remote: Remote,
    key: String,
    upload_id: String,
    buffer: Vec<u8>,
    next_offset: u64,
    next_part: u32,
    part_size: usize,
    finished: bool,
    cancel: CancellationToken,
}

impl ObjectWriter {
    async fn upload_part(&mut self, data: Vec<u8>) -> VfsResult<()> {
        let part = self.next_part;
        let remote = &self.remote;
        let upload_id = &self.upload_id;
        run_with_retry(remote.retry.as_ref(), "UploadPart", &self.cancel, || {
            remote.client.upload_part(upload_id, part, data.clone())
        })
        .await
        .map_err(|e| VfsError::backend("UploadPart", e))?;
        self.next_part += 1;
        Ok(())
    }

    async fn discard(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        // Abort must go through even when the transfer's token was cancelled.
        let token = CancellationToken::new();
        let remote = &self.remote;
        let upload_id = &self.upload_id;
        if let Err(e) = run_with_retry(remote.retry.as_ref(), "AbortMultipartUpload", &token, || {
            remote.client.abort_multipart_upload(upload_id)
        })
        .await
        {
            warn!(key = %self.key, error = %e, "failed to abort multipart upload");
        }
    }
}

#[async_trait]
impl BackendFile for ObjectWriter {
    async fn read_at(&mut self, _offset: u64, _len: u32) -> VfsResult<Vec<u8>> {
        Err(VfsError::unsupported("read on an object-store upload"))
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> VfsResult<usize> {
        if offset != self.next_offset {
            return Err(VfsError::unsupported(format!(
                "non-sequential write at {offset}, expected {}",
                self.next_offset
            )));
        }
        self.buffer.extend_from_slice(data);
        self.next_offset += data.len() as u64;
        while self.buffer.len() >= self.part_size {
            let rest = self.buffer.split_off(self.part_size);
            let part = std::mem::replace(&mut self.buffer, rest);
            self.upload_part(part).await?;
        }
        Ok(data.len())
    }

    async fn truncate(&mut self, size: u64) -> VfsResult<()> {
        if size == 0 && self.next_offset == 0 {
            return Ok(());
        }
        Err(VfsError::unsupported("truncate on an object-store upload"))
    }

    async fn close(&mut self) -> VfsResult<()> {
        if self.finished {
            return Ok(());
        }
        if !self.buffer.is_empty() || self.next_part == 1 {
            let part = std::mem::take(&mut self.buffer);
            if let Err(e) = self.upload_part(part).await {
                self.discard().await;
                return Err(e);
            }
        }
        let remote = &self.remote;
        let upload_id = &self.upload_id;
        let completed = run_with_retry(
            remote.retry.as_ref(),
            "CompleteMultipartUpload",
            &self.cancel,
            || remote.client.complete_multipart_upload(upload_id),
        )
        .await;
        match completed {
            Ok(()) => {
                self.finished = true;
                debug!(key = %self.key, bytes = self.next_offset, "multipart upload completed");
                Ok(())
            }
            Err(e) => {
                self.discard().await;
                Err(VfsError::backend("CompleteMultipartUpload", e))
            }
        }
    }

    async fn abort(&mut self) -> VfsResult<bool> {
        self.discard().await;
        Ok(false)
    }
}
