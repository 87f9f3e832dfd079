//! # sluice-kernel
//!
//! Core crate for the sluice file-transfer server.
//!
//! A session sees one virtual filesystem. The kernel sits between the
//! decoded protocol requests and the storage backend:
//! - Scopes client paths to the session's folder prefix
//! - Resolves virtual paths to local paths or object keys, confined to
//!   the user's root or key prefix
//! - Checks permissions, file filters and quota before touching storage
//! - Runs uploads and downloads to completion, including atomic renames,
//!   resumes and usage accounting
//! - Retries transient object-store failures with backoff

pub mod config;
pub mod connection;
pub mod db;
pub mod prefix;
pub mod quota;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod transfer;
pub mod translate;
pub mod user;
pub mod vfs;

pub use config::{FilesystemConfig, FilesystemProvider, RetryConfig, Settings};
pub use connection::{Connection, Request, Response};
pub use db::SqliteStore;
pub use prefix::PathVirtualizer;
pub use quota::{QuotaManager, QuotaResult};
pub use resolver::{ResolvedObject, resolve_key, resolve_object_path};
pub use retry::{DefaultRetryPolicy, ObjectStoreRetryer, RetryPolicy};
pub use store::{MemoryStore, StoreError, Usage, UserStore, hash_password, hash_password_with_cost, verify_password};
pub use transfer::{Transfer, TransferDirection, TransferPhase};
pub use translate::{TranslateError, TranslateRequest, TranslateResponse, translate_path};
pub use user::{FilePattern, PatternFilter, Permission, User, VirtualFolder};
pub use vfs::{
    BackendFile, DirEntry, FileAttr, FileType, Fs, LocalBackend, MemoryObjectClient, ObjectClient,
    ObjectClientFactory, ObjectStoreBackend, OpenFlags, SetAttr, StatusCode, VfsError, VfsResult, build_fs,
};
