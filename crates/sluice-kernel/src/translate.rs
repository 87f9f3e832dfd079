//! Translate a user's path to the object key it is stored under.
//!
//! This is what an administrative surface calls to find where a file lives
//! in the user's bucket. It authenticates the user, then resolves through
//! [`resolve_object_path`], the same confinement check the object-store
//! backend uses.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::FilesystemProvider;
use crate::resolver::{ResolvedObject, resolve_object_path};
use crate::store::{StoreError, UserStore};
use crate::vfs::VfsError;

/// Input of a translation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateRequest {
    pub username: String,
    pub password: String,
    pub filepath: String,
}

/// Where the file lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslateResponse {
    pub provider: FilesystemProvider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub bucket: String,
    pub key: String,
}

impl From<ResolvedObject> for TranslateResponse {
    fn from(r: ResolvedObject) -> Self {
        Self {
            provider: r.provider,
            region: r.region,
            bucket: r.bucket,
            key: r.key,
        }
    }
}

/// Broad class of a translation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authentication,
    NotFound,
    Internal,
}

/// Translation errors.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("username is required")]
    UsernameRequired,

    #[error("password is required")]
    PasswordRequired,

    #[error("filepath is required")]
    FilePathRequired,

    #[error("filepath is invalid")]
    FilePathInvalid,

    #[error("filesystem is not s3")]
    FileSystemNotS3,

    #[error("filesystem is not supported")]
    FileSystemNotSupported,

    #[error("Access Denied")]
    AccessDenied,

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl TranslateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranslateError::AccessDenied => ErrorKind::Authentication,
            TranslateError::UserNotFound(_) => ErrorKind::NotFound,
            TranslateError::Store(_) => ErrorKind::Internal,
            _ => ErrorKind::Validation,
        }
    }

    /// HTTP-style status for API surfaces.
    pub fn status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::Authentication => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Internal => 500,
        }
    }
}

impl From<StoreError> for TranslateError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidCredentials => TranslateError::AccessDenied,
            StoreError::UserNotFound(name) => TranslateError::UserNotFound(name),
            other => TranslateError::Store(other),
        }
    }
}

impl TranslateRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>, filepath: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            filepath: filepath.into(),
        }
    }

    /// Trim every field and check the request is well formed.
    pub fn validate(&mut self) -> Result<(), TranslateError> {
        self.username = self.username.trim().to_string();
        self.password = self.password.trim().to_string();
        self.filepath = self.filepath.trim().to_string();

        if self.username.is_empty() {
            return Err(TranslateError::UsernameRequired);
        }
        if self.password.is_empty() {
            return Err(TranslateError::PasswordRequired);
        }
        if self.filepath.is_empty() {
            return Err(TranslateError::FilePathRequired);
        }
        if self.filepath == "/" || self.filepath == "." {
            return Err(TranslateError::FilePathInvalid);
        }
        Ok(())
    }
}

/// Authenticate and resolve `request.filepath` for the user's backend.
pub async fn translate_path(
    store: &dyn UserStore,
    mut request: TranslateRequest,
) -> Result<TranslateResponse, TranslateError> {
    request.validate()?;
    let user = store
        .check_credentials(&request.username, &request.password)
        .await?;
    let resolved = resolve_object_path(&user.filesystem, &request.filepath).map_err(|e| match e {
        VfsError::PathInvalid(_) => TranslateError::FilePathInvalid,
        _ => TranslateError::FileSystemNotSupported,
    })?;
    debug!(user = %user.username, key = %resolved.key, "translated path");
    Ok(resolved.into())
}

/// S3-only variant kept for older API clients.
#[deprecated(note = "use translate_path")]
pub async fn translate_s3_path(
    store: &dyn UserStore,
    request: TranslateRequest,
) -> Result<TranslateResponse, TranslateError> {
    let response = translate_path(store, request).await?;
    if response.provider != FilesystemProvider::S3 {
        return Err(TranslateError::FileSystemNotS3);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_trims_and_rejects() {
        let mut ok = TranslateRequest::new(" alice ", " pw ", " /a.txt ");
        ok.validate().unwrap();
        assert_eq!(ok.username, "alice");
        assert_eq!(ok.filepath, "/a.txt");

        let cases = [
            (TranslateRequest::new("", "pw", "/a"), "username is required"),
            (TranslateRequest::new("a", "  ", "/a"), "password is required"),
            (TranslateRequest::new("a", "pw", ""), "filepath is required"),
            (TranslateRequest::new("a", "pw", "/"), "filepath is invalid"),
            (TranslateRequest::new("a", "pw", "."), "filepath is invalid"),
        ];
        for (mut req, msg) in cases {
            let err = req.validate().unwrap_err();
            assert_eq!(err.to_string(), msg);
            assert_eq!(err.status(), 400);
        }
    }

    #[test]
    fn test_status_classes() {
        assert_eq!(TranslateError::AccessDenied.status(), 403);
        assert_eq!(TranslateError::AccessDenied.kind(), ErrorKind::Authentication);
        assert_eq!(TranslateError::UserNotFound("x".into()).status(), 404);
        assert_eq!(TranslateError::FileSystemNotS3.status(), 400);
        assert!(matches!(
            TranslateError::from(StoreError::InvalidCredentials),
            TranslateError::AccessDenied
        ));
    }

    #[test]
    fn test_response_json_omits_empty_region() {
        let response = TranslateResponse {
            provider: FilesystemProvider::Gcs,
            region: None,
            bucket: "b".into(),
            key: "/k".into(),
        };
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"provider":"gcs","bucket":"b","key":"/k"}"#
        );
    }
}
