//! SFTP subsystem.
//!
//! `russh-sftp` does the packet framing; [`SftpSession`] turns each packet
//! into a kernel [`Request`] and the kernel's reply back into a packet.
//! Handles are opaque hex strings naming either an open transfer or a
//! directory listing that has been read in full.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags as SftpOpenFlags, Status, StatusCode, Version,
};
use tracing::debug;

use sluice_kernel::vfs::path::{clean_path, join};
use sluice_kernel::{
    Connection, DirEntry, FileAttr, FileType, OpenFlags, Request, Response, SetAttr, StatusCode as KernelStatus,
    Transfer, VfsError,
};

use crate::constants::SFTP_HANDLE_LIMIT;

enum SessionHandle {
    File { transfer: Arc<Transfer>, path: String },
    Dir { entries: Option<Vec<DirEntry>> },
}

/// One SFTP session over an authenticated connection.
pub struct SftpSession {
    conn: Arc<Connection>,
    handles: HashMap<String, SessionHandle>,
    next_handle: u64,
}

impl SftpSession {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    fn insert_handle(&mut self, handle: SessionHandle) -> Result<String, StatusCode> {
        if self.handles.len() >= SFTP_HANDLE_LIMIT {
            return Err(StatusCode::Failure);
        }
        let id = format!("{:x}", self.next_handle);
        self.next_handle += 1;
        self.handles.insert(id.clone(), handle);
        Ok(id)
    }

    fn transfer(&self, handle: &str) -> Result<(Arc<Transfer>, String), StatusCode> {
        match self.handles.get(handle) {
            Some(SessionHandle::File { transfer, path }) => Ok((transfer.clone(), path.clone())),
            _ => Err(StatusCode::NoSuchFile),
        }
    }

    /// Absolute client path for `path`, relative paths anchored at the
    /// session's folder prefix.
    fn absolute(&self, path: &str) -> String {
        if path.starts_with('/') {
            clean_path(path)
        } else {
            join(&self.home(), path)
        }
    }

    fn home(&self) -> String {
        match self.conn.folder_prefix() {
            "" => "/".to_string(),
            prefix => clean_path(prefix),
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response, StatusCode> {
        self.conn.handle(request).await.map_err(status)
    }

    async fn command(&self, id: u32, request: Request) -> Result<Status, StatusCode> {
        self.dispatch(request).await?;
        Ok(ok(id))
    }

    async fn attrs(&self, id: u32, request: Request) -> Result<Attrs, StatusCode> {
        let entry = self.dispatch(request).await?.into_entry().ok_or(StatusCode::Failure)?;
        Ok(Attrs {
            id,
            attrs: to_attributes(&entry.attr),
        })
    }
}

impl russh_sftp::server::Handler for SftpSession {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(&mut self, version: u32, _extensions: HashMap<String, String>) -> Result<Version, Self::Error> {
        debug!(conn = self.conn.id(), version, "sftp init");
        Ok(Version {
            version: russh_sftp::protocol::VERSION,
            extensions: HashMap::new(),
        })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: SftpOpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let path = self.absolute(&filename);
        let flags = to_open_flags(pflags);
        let request = if flags.is_write() {
            Request::Write {
                path: path.clone(),
                flags,
            }
        } else {
            Request::Read { path: path.clone() }
        };
        let transfer = self.dispatch(request).await?.into_transfer().ok_or(StatusCode::Failure)?;
        match self.insert_handle(SessionHandle::File {
            transfer: transfer.clone(),
            path,
        }) {
            Ok(handle) => Ok(Handle { id, handle }),
            Err(code) => {
                let _ = self.conn.close_transfer(transfer.id()).await;
                Err(code)
            }
        }
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(SessionHandle::File { transfer, .. }) => {
                self.conn.close_transfer(transfer.id()).await.map_err(status)?;
                Ok(ok(id))
            }
            Some(SessionHandle::Dir { .. }) => Ok(ok(id)),
            None => Err(StatusCode::NoSuchFile),
        }
    }

    async fn read(&mut self, id: u32, handle: String, offset: u64, len: u32) -> Result<Data, Self::Error> {
        let (transfer, _) = self.transfer(&handle)?;
        self.conn.touch();
        let data = transfer.read_at(offset, len).await.map_err(status)?;
        if data.is_empty() {
            return Err(StatusCode::Eof);
        }
        Ok(Data { id, data })
    }

    async fn write(&mut self, id: u32, handle: String, offset: u64, data: Vec<u8>) -> Result<Status, Self::Error> {
        let (transfer, _) = self.transfer(&handle)?;
        self.conn.touch();
        transfer.write_at(offset, &data).await.map_err(status)?;
        Ok(ok(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let path = self.absolute(&path);
        self.attrs(id, Request::Lstat { path }).await
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let path = self.absolute(&path);
        self.attrs(id, Request::Stat { path }).await
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let (_, path) = self.transfer(&handle)?;
        self.attrs(id, Request::Stat { path }).await
    }

    async fn setstat(&mut self, id: u32, path: String, attrs: FileAttributes) -> Result<Status, Self::Error> {
        let path = self.absolute(&path);
        self.command(
            id,
            Request::SetStat {
                path,
                attrs: to_set_attr(&attrs),
            },
        )
        .await
    }

    async fn fsetstat(&mut self, id: u32, handle: String, attrs: FileAttributes) -> Result<Status, Self::Error> {
        let (_, path) = self.transfer(&handle)?;
        self.command(
            id,
            Request::SetStat {
                path,
                attrs: to_set_attr(&attrs),
            },
        )
        .await
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let path = self.absolute(&path);
        let entries = self
            .dispatch(Request::List { path })
            .await?
            .into_entries()
            .ok_or(StatusCode::Failure)?;
        let handle = self.insert_handle(SessionHandle::Dir {
            entries: Some(entries),
        })?;
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let entries = match self.handles.get_mut(&handle) {
            Some(SessionHandle::Dir { entries }) => entries.take(),
            _ => return Err(StatusCode::NoSuchFile),
        };
        match entries {
            Some(entries) if !entries.is_empty() => Ok(Name {
                id,
                files: entries.iter().map(to_file).collect(),
            }),
            _ => Err(StatusCode::Eof),
        }
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        let path = self.absolute(&filename);
        self.command(id, Request::Remove { path }).await
    }

    async fn mkdir(&mut self, id: u32, path: String, _attrs: FileAttributes) -> Result<Status, Self::Error> {
        let path = self.absolute(&path);
        self.command(id, Request::Mkdir { path }).await
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        let path = self.absolute(&path);
        self.command(id, Request::Rmdir { path }).await
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = if path.is_empty() || path == "." {
            self.home()
        } else {
            self.absolute(&path)
        };
        Ok(Name {
            id,
            files: vec![File::dummy(resolved)],
        })
    }

    async fn rename(&mut self, id: u32, oldpath: String, newpath: String) -> Result<Status, Self::Error> {
        let source = self.absolute(&oldpath);
        let target = self.absolute(&newpath);
        self.command(id, Request::Rename { source, target }).await
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let path = self.absolute(&path);
        match self.dispatch(Request::Readlink { path }).await? {
            Response::Link(target) => Ok(Name {
                id,
                files: vec![File::dummy(target)],
            }),
            _ => Err(StatusCode::Failure),
        }
    }

    /// OpenSSH sends the target first, the reverse of the draft's order
    /// that `russh-sftp` names its arguments after.
    async fn symlink(&mut self, id: u32, linkpath: String, targetpath: String) -> Result<Status, Self::Error> {
        let target = self.absolute(&linkpath);
        let link = self.absolute(&targetpath);
        self.command(id, Request::Symlink { target, link }).await
    }
}

fn ok(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

/// Protocol status for a kernel error. The error text stays server-side.
fn status(e: VfsError) -> StatusCode {
    debug!(error = %e, "sftp request failed");
    match e.status_code() {
        KernelStatus::Ok => StatusCode::Ok,
        KernelStatus::Eof => StatusCode::Eof,
        KernelStatus::NoSuchFile => StatusCode::NoSuchFile,
        KernelStatus::PermissionDenied => StatusCode::PermissionDenied,
        KernelStatus::Failure => StatusCode::Failure,
        KernelStatus::BadMessage => StatusCode::BadMessage,
        KernelStatus::OpUnsupported => StatusCode::OpUnsupported,
    }
}

fn to_open_flags(pflags: SftpOpenFlags) -> OpenFlags {
    OpenFlags {
        read: pflags.contains(SftpOpenFlags::READ),
        write: pflags.contains(SftpOpenFlags::WRITE),
        append: pflags.contains(SftpOpenFlags::APPEND),
        create: pflags.contains(SftpOpenFlags::CREATE),
        truncate: pflags.contains(SftpOpenFlags::TRUNCATE),
        exclusive: pflags.contains(SftpOpenFlags::EXCLUDE),
    }
}

fn to_set_attr(attrs: &FileAttributes) -> SetAttr {
    let mut set = SetAttr::new();
    set.size = attrs.size;
    set.perm = attrs.permissions.map(|p| p & 0o7777);
    if let (Some(uid), Some(gid)) = (attrs.uid, attrs.gid) {
        set.owner = Some((uid, gid));
    }
    if let (Some(atime), Some(mtime)) = (attrs.atime, attrs.mtime) {
        set.times = Some((from_unix(atime), from_unix(mtime)));
    }
    set
}

fn to_attributes(attr: &FileAttr) -> FileAttributes {
    let mut attrs = FileAttributes {
        size: Some(attr.size),
        uid: attr.uid,
        gid: attr.gid,
        permissions: Some(attr.perm & 0o7777),
        atime: Some(to_unix(attr.atime.unwrap_or(attr.mtime))),
        mtime: Some(to_unix(attr.mtime)),
        ..Default::default()
    };
    match attr.kind {
        FileType::File => attrs.set_regular(true),
        FileType::Directory => attrs.set_dir(true),
        FileType::Symlink => attrs.set_symlink(true),
    }
    attrs
}

fn to_file(entry: &DirEntry) -> File {
    File::new(entry.name.clone(), to_attributes(&entry.attr))
}

fn to_unix(time: SystemTime) -> u32 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as u32
}

fn from_unix(secs: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(u64::from(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags() {
        let flags = to_open_flags(SftpOpenFlags::WRITE | SftpOpenFlags::CREATE | SftpOpenFlags::TRUNCATE);
        assert_eq!(flags, OpenFlags::create_truncate());
        assert!(!to_open_flags(SftpOpenFlags::READ).is_write());
        assert!(to_open_flags(SftpOpenFlags::WRITE | SftpOpenFlags::APPEND).is_resume());
    }

    #[test]
    fn test_set_attr_requires_pairs() {
        let attrs = FileAttributes {
            uid: Some(1000),
            mtime: Some(10),
            permissions: Some(0o100644),
            ..Default::default()
        };
        let set = to_set_attr(&attrs);
        assert_eq!(set.perm, Some(0o644));
        assert_eq!(set.owner, None);
        assert_eq!(set.times, None);

        let attrs = FileAttributes {
            uid: Some(1000),
            gid: Some(100),
            atime: Some(5),
            mtime: Some(10),
            size: Some(0),
            ..Default::default()
        };
        let set = to_set_attr(&attrs);
        assert_eq!(set.owner, Some((1000, 100)));
        assert_eq!(set.times, Some((from_unix(5), from_unix(10))));
        assert_eq!(set.size, Some(0));
    }

    #[test]
    fn test_attributes_carry_kind() {
        let mtime = from_unix(1_700_000_000);
        let dir = to_attributes(&FileAttr::directory(mtime));
        assert!(dir.is_dir());
        assert_eq!(dir.mtime, Some(1_700_000_000));

        let file = to_attributes(&FileAttr::file(42, mtime));
        assert!(file.is_regular());
        assert_eq!(file.size, Some(42));

        assert!(to_attributes(&FileAttr::symlink(3, mtime)).is_symlink());
    }

    #[test]
    fn test_status_hides_details() {
        assert_eq!(status(VfsError::QuotaExceeded), StatusCode::Failure);
        assert_eq!(status(VfsError::not_exist("/secret/path")), StatusCode::NoSuchFile);
        assert_eq!(status(VfsError::path_invalid("../x")), StatusCode::PermissionDenied);
        assert_eq!(status(VfsError::unsupported("resume")), StatusCode::OpUnsupported);
    }
}
