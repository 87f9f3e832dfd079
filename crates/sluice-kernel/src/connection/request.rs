//! Decoded protocol requests.

use std::sync::Arc;

use crate::transfer::Transfer;
use crate::vfs::{DirEntry, OpenFlags, SetAttr};

/// One file operation from a client, with client-visible paths.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Open a file for download.
    Read { path: String },
    /// Open a file for upload (optionally also for reading).
    Write { path: String, flags: OpenFlags },
    SetStat { path: String, attrs: SetAttr },
    Rename { source: String, target: String },
    Rmdir { path: String },
    Mkdir { path: String },
    /// Create `link` pointing at `target`.
    Symlink { target: String, link: String },
    Remove { path: String },
    List { path: String },
    Stat { path: String },
    Readlink { path: String },
    Lstat { path: String },
}

impl Request {
    /// Protocol method name, for logs.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Read { .. } => "Get",
            Request::Write { .. } => "Put",
            Request::SetStat { .. } => "Setstat",
            Request::Rename { .. } => "Rename",
            Request::Rmdir { .. } => "Rmdir",
            Request::Mkdir { .. } => "Mkdir",
            Request::Symlink { .. } => "Symlink",
            Request::Remove { .. } => "Remove",
            Request::List { .. } => "List",
            Request::Stat { .. } => "Stat",
            Request::Readlink { .. } => "Readlink",
            Request::Lstat { .. } => "Lstat",
        }
    }

    /// The primary path of the request.
    pub fn path(&self) -> &str {
        match self {
            Request::Read { path }
            | Request::Write { path, .. }
            | Request::SetStat { path, .. }
            | Request::Rmdir { path }
            | Request::Mkdir { path }
            | Request::Remove { path }
            | Request::List { path }
            | Request::Stat { path }
            | Request::Readlink { path }
            | Request::Lstat { path } => path,
            Request::Rename { source, .. } => source,
            Request::Symlink { target, .. } => target,
        }
    }

    /// The second path of a rename or symlink.
    pub fn target(&self) -> Option<&str> {
        match self {
            Request::Rename { target, .. } => Some(target),
            Request::Symlink { link, .. } => Some(link),
            _ => None,
        }
    }
}

/// Result of a handled request.
#[derive(Debug)]
pub enum Response {
    Ok,
    Transfer(Arc<Transfer>),
    Entries(Vec<DirEntry>),
    Entry(DirEntry),
    /// Client-visible symlink target.
    Link(String),
}

impl Response {
    pub fn into_transfer(self) -> Option<Arc<Transfer>> {
        match self {
            Response::Transfer(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_entries(self) -> Option<Vec<DirEntry>> {
        match self {
            Response::Entries(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn into_entry(self) -> Option<DirEntry> {
        match self {
            Response::Entry(entry) => Some(entry),
            _ => None,
        }
    }
}
