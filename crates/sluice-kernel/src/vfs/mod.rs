//! Virtual filesystem abstraction.
//!
//! Sessions see one slash-separated virtual tree; a backend maps it onto
//! real storage. Key components:
//!
//! - [`Fs`] - Capability trait every backend implements
//! - [`BackendFile`] - An open file with explicit-offset reads and writes
//! - [`LocalBackend`] - Local disk, confined to the user's home
//! - [`ObjectStoreBackend`] - Bucket/key stores over an [`ObjectClient`]
//!
//! ## Design Decisions
//!
//! - **Path-based, no inodes**: the transfer protocol addresses files by path.
//! - **Explicit offset/size**: handles carry no implicit cursor.
//! - **Statuses, not messages**: [`VfsError::status_code`] decides what a
//!   client sees; backend error text stays in the logs.

pub mod backends;
mod error;
mod ops;
pub mod path;
pub mod types;

pub use backends::{
    LocalBackend, MemoryObjectClient, ObjectClient, ObjectClientFactory, ObjectError, ObjectStoreBackend, build_fs,
};
pub use error::{StatusCode, VfsError, VfsResult};
pub use ops::{BackendFile, Fs, OpenedFile};
pub use types::{DirEntry, FileAttr, FileType, OpenFlags, SetAttr};
