//! VFS error types.

use std::io;
use thiserror::Error;

use super::backends::ObjectError;

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Path is absent, or lies outside the session scope.
    #[error("not found: {0}")]
    NotExist(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Permission or file-name filter denied the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Quota or maximum upload size exceeded.
    #[error("quota exceeded")]
    QuotaExceeded,

    /// Path is malformed or escapes its confinement root.
    #[error("invalid path: {0}")]
    PathInvalid(String),

    /// The backend or the requested mode cannot perform this operation.
    #[error("operation unsupported: {0}")]
    Unsupported(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Remote storage failure, after retries.
    #[error("backend error during {op}: {source}")]
    Backend {
        op: String,
        #[source]
        source: ObjectError,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create a NotExist error.
    pub fn not_exist(path: impl Into<String>) -> Self {
        Self::NotExist(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::PermissionDenied(path.into())
    }

    /// Create a PathInvalid error.
    pub fn path_invalid(path: impl Into<String>) -> Self {
        Self::PathInvalid(path.into())
    }

    /// Create an Unsupported error.
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    /// Wrap a remote storage error.
    pub fn backend(op: impl Into<String>, source: ObjectError) -> Self {
        match source {
            ObjectError::NotFound(key) => Self::NotExist(key),
            source => Self::Backend {
                op: op.into(),
                source,
            },
        }
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// True when the path does not exist.
    pub fn is_not_exist(&self) -> bool {
        match self {
            VfsError::NotExist(_) => true,
            VfsError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// True for transient remote failures that were eligible for retry.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, VfsError::Backend { source, .. } if source.is_connection_error())
    }

    /// Protocol-level status for this error.
    ///
    /// Quota and backend failures collapse into [`StatusCode::Failure`] so
    /// that neither quota internals nor backend diagnostics reach the client.
    pub fn status_code(&self) -> StatusCode {
        match self {
            VfsError::NotExist(_) => StatusCode::NoSuchFile,
            VfsError::PermissionDenied(_) | VfsError::PathInvalid(_) => {
                StatusCode::PermissionDenied
            }
            VfsError::Unsupported(_) => StatusCode::OpUnsupported,
            VfsError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => StatusCode::NoSuchFile,
                io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
                io::ErrorKind::Unsupported => StatusCode::OpUnsupported,
                _ => StatusCode::Failure,
            },
            VfsError::QuotaExceeded
            | VfsError::AlreadyExists(_)
            | VfsError::NotADirectory(_)
            | VfsError::IsADirectory(_)
            | VfsError::DirectoryNotEmpty(_)
            | VfsError::Backend { .. }
            | VfsError::Other(_) => StatusCode::Failure,
        }
    }
}

/// Transfer-protocol status codes the core can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum StatusCode {
    Ok,
    Eof,
    NoSuchFile,
    PermissionDenied,
    Failure,
    BadMessage,
    OpUnsupported,
}

impl StatusCode {
    /// Client-facing message. Never carries backend text.
    pub fn message(&self) -> &'static str {
        match self {
            StatusCode::Ok => "Success",
            StatusCode::Eof => "End of file",
            StatusCode::NoSuchFile => "No such file or directory",
            StatusCode::PermissionDenied => "Permission denied",
            StatusCode::Failure => "Failure",
            StatusCode::BadMessage => "Bad message",
            StatusCode::OpUnsupported => "Operation unsupported",
        }
    }
}

impl From<&VfsError> for StatusCode {
    fn from(e: &VfsError) -> Self {
        e.status_code()
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::NotExist(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::PermissionDenied(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::QuotaExceeded => io::Error::other("quota exceeded"),
            VfsError::PathInvalid(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::Unsupported(msg) => io::Error::new(io::ErrorKind::Unsupported, msg),
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            VfsError::DirectoryNotEmpty(msg) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg)
            }
            VfsError::Backend { op, source } => io::Error::other(format!("{op}: {source}")),
            VfsError::Io(e) => e,
            VfsError::Other(msg) => io::Error::other(msg),
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_hides_internals() {
        assert_eq!(VfsError::QuotaExceeded.status_code(), StatusCode::Failure);
        assert_eq!(
            VfsError::backend("GetObject", ObjectError::service("InternalError", "disk on fire"))
                .status_code(),
            StatusCode::Failure
        );
        assert_eq!(StatusCode::Failure.message(), "Failure");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(VfsError::not_exist("/a").status_code(), StatusCode::NoSuchFile);
        assert_eq!(
            VfsError::permission_denied("/a").status_code(),
            StatusCode::PermissionDenied
        );
        assert_eq!(
            VfsError::unsupported("read").status_code(),
            StatusCode::OpUnsupported
        );
        let io = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(VfsError::from(io).status_code(), StatusCode::NoSuchFile);
    }

    #[test]
    fn test_backend_not_found_becomes_not_exist() {
        let err = VfsError::backend("HeadObject", ObjectError::NotFound("k".into()));
        assert!(err.is_not_exist());
    }

    #[test]
    fn test_connection_classification() {
        let err = VfsError::backend(
            "UploadPart",
            ObjectError::service("ServiceUnavailable", "try later"),
        );
        assert!(err.is_connection_error());
        assert!(!VfsError::QuotaExceeded.is_connection_error());
    }
}
