//! Core VFS types.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }
}

/// File attributes (metadata).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttr {
    /// Size in bytes.
    pub size: u64,
    /// File type.
    pub kind: FileType,
    /// Unix permissions (e.g., 0o644).
    pub perm: u32,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Last access time (optional).
    pub atime: Option<SystemTime>,
    /// User ID (optional, for local fs).
    pub uid: Option<u32>,
    /// Group ID (optional, for local fs).
    pub gid: Option<u32>,
}

impl FileAttr {
    /// Attributes for a regular file.
    pub fn file(size: u64, mtime: SystemTime) -> Self {
        Self {
            size,
            kind: FileType::File,
            perm: 0o644,
            mtime,
            atime: None,
            uid: None,
            gid: None,
        }
    }

    /// Attributes for a directory.
    pub fn directory(mtime: SystemTime) -> Self {
        Self {
            size: 0,
            kind: FileType::Directory,
            perm: 0o755,
            mtime,
            atime: None,
            uid: None,
            gid: None,
        }
    }

    /// Attributes for a symlink.
    pub fn symlink(target_len: u64, mtime: SystemTime) -> Self {
        Self {
            size: target_len,
            kind: FileType::Symlink,
            perm: 0o777,
            mtime,
            atime: None,
            uid: None,
            gid: None,
        }
    }

    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }
}

/// Directory entry, or the single result of a stat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Entry attributes.
    pub attr: FileAttr,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(name: impl Into<String>, attr: FileAttr) -> Self {
        Self {
            name: name.into(),
            attr,
        }
    }
}

/// Generic attribute-change record for set-stat requests.
///
/// Each field is applied only when present; owner changes require both
/// ids to be given together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetAttr {
    /// New size (truncate/extend).
    pub size: Option<u64>,
    /// New permission bits.
    pub perm: Option<u32>,
    /// New owner as `(uid, gid)`.
    pub owner: Option<(u32, u32)>,
    /// New access and modification times.
    pub times: Option<(SystemTime, SystemTime)>,
}

impl SetAttr {
    /// Create a new empty SetAttr.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Set permissions.
    pub fn with_perm(mut self, perm: u32) -> Self {
        self.perm = Some(perm);
        self
    }

    /// Set the owner.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.owner = Some((uid, gid));
        self
    }

    /// Set access and modification times.
    pub fn with_times(mut self, atime: SystemTime, mtime: SystemTime) -> Self {
        self.times = Some((atime, mtime));
        self
    }

    /// True when nothing would change.
    pub fn is_empty(&self) -> bool {
        self.size.is_none() && self.perm.is_none() && self.owner.is_none() && self.times.is_none()
    }
}

/// Open file flags as sent by the transfer protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Append mode.
    pub append: bool,
    /// Create if not exists.
    pub create: bool,
    /// Truncate on open.
    pub truncate: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
}

impl OpenFlags {
    /// Read-only access.
    pub fn read() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    /// Write access.
    pub fn write() -> Self {
        Self {
            write: true,
            ..Default::default()
        }
    }

    /// Create and truncate with write access, the usual upload open.
    pub fn create_truncate() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    /// Append without truncation, the resume open.
    pub fn append() -> Self {
        Self {
            write: true,
            append: true,
            ..Default::default()
        }
    }

    /// True when the open asks for any kind of write.
    pub fn is_write(&self) -> bool {
        self.write || self.append || self.create || self.truncate
    }

    /// True when the client wants to continue an interrupted upload.
    pub fn is_resume(&self) -> bool {
        self.append && !self.truncate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type() {
        assert!(FileType::File.is_file());
        assert!(!FileType::File.is_dir());
        assert!(FileType::Directory.is_dir());
        assert!(FileType::Symlink.is_symlink());
    }

    #[test]
    fn test_setattr_builder() {
        let attr = SetAttr::new().with_size(2048).with_perm(0o600);
        assert_eq!(attr.size, Some(2048));
        assert_eq!(attr.perm, Some(0o600));
        assert!(attr.times.is_none());
        assert!(!attr.is_empty());
        assert!(SetAttr::new().is_empty());
    }

    #[test]
    fn test_open_flags_resume() {
        assert!(OpenFlags::append().is_resume());
        let trunc_append = OpenFlags {
            append: true,
            truncate: true,
            write: true,
            ..Default::default()
        };
        assert!(!trunc_append.is_resume());
        assert!(!OpenFlags::read().is_write());
        assert!(OpenFlags::create_truncate().is_write());
    }
}
