//! User and quota-usage store.
//!
//! The connection layer reads users and charges usage through
//! [`UserStore`]. Usage deltas are applied atomically per counter; there is
//! no reservation, so two concurrent uploads can both pass a quota check
//! and overshoot the limit by one transfer.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::user::User;

/// bcrypt cost for new password hashes.
pub const PASSWORD_HASH_COST: u32 = bcrypt::DEFAULT_COST;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("password hash error: {0}")]
    PasswordHash(#[from] bcrypt::BcryptError),

    #[error("blocking task failed: {0}")]
    Blocking(String),
}

/// Tracked usage of a user or virtual folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub files: u64,
    pub size: u64,
}

impl Usage {
    /// Apply a signed delta, clamping at zero, or overwrite when `reset`.
    pub fn apply(&mut self, files: i64, size: i64, reset: bool) {
        if reset {
            self.files = files.max(0) as u64;
            self.size = size.max(0) as u64;
        } else {
            self.files = self.files.saturating_add_signed(files);
            self.size = self.size.saturating_add_signed(size);
        }
    }
}

/// Users, credentials and usage counters.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn user(&self, username: &str) -> Result<User, StoreError>;

    /// Load a user and verify their password.
    async fn check_credentials(&self, username: &str, password: &str) -> Result<User, StoreError> {
        let user = self.user(username).await?;
        let password = password.to_string();
        let stored = user.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || verify_password(&password, &stored))
            .await
            .map_err(|e| StoreError::Blocking(e.to_string()))?;
        if verified {
            Ok(user)
        } else {
            Err(StoreError::InvalidCredentials)
        }
    }

    async fn used_quota(&self, username: &str) -> Result<Usage, StoreError>;

    async fn used_folder_quota(&self, folder: &str) -> Result<Usage, StoreError>;

    /// Add a delta to a user's usage, or set it when `reset`.
    async fn update_quota(&self, username: &str, files: i64, size: i64, reset: bool) -> Result<(), StoreError>;

    /// Add a delta to a virtual folder's usage, or set it when `reset`.
    async fn update_folder_quota(&self, folder: &str, files: i64, size: i64, reset: bool) -> Result<(), StoreError>;
}

/// In-memory store for tests and config-seeded deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<String, User>,
    usage: DashMap<String, Usage>,
    folders: DashMap<String, Usage>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user. Existing usage is kept.
    pub fn add_user(&self, user: User) {
        self.usage.entry(user.username.clone()).or_default();
        self.users.insert(user.username.clone(), user);
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn user(&self, username: &str) -> Result<User, StoreError> {
        self.users
            .get(username)
            .map(|u| u.clone())
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))
    }

    async fn used_quota(&self, username: &str) -> Result<Usage, StoreError> {
        self.usage
            .get(username)
            .map(|u| *u)
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))
    }

    async fn used_folder_quota(&self, folder: &str) -> Result<Usage, StoreError> {
        Ok(self.folders.get(folder).map(|u| *u).unwrap_or_default())
    }

    async fn update_quota(&self, username: &str, files: i64, size: i64, reset: bool) -> Result<(), StoreError> {
        let mut usage = self
            .usage
            .get_mut(username)
            .ok_or_else(|| StoreError::UserNotFound(username.to_string()))?;
        usage.apply(files, size, reset);
        Ok(())
    }

    async fn update_folder_quota(&self, folder: &str, files: i64, size: i64, reset: bool) -> Result<(), StoreError> {
        self.folders
            .entry(folder.to_string())
            .or_default()
            .apply(files, size, reset);
        Ok(())
    }
}

// ============================================================================
// Password hashing
// ============================================================================

/// Hash a password with bcrypt at [`PASSWORD_HASH_COST`].
pub fn hash_password(password: &str) -> Result<String, StoreError> {
    hash_password_with_cost(password, PASSWORD_HASH_COST)
}

pub fn hash_password_with_cost(password: &str, cost: u32) -> Result<String, StoreError> {
    Ok(bcrypt::hash(password, cost)?)
}

/// Verify a password against a stored bcrypt hash.
///
/// Empty passwords and malformed hashes never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    if password.is_empty() {
        return false;
    }
    match bcrypt::verify(password, stored) {
        Ok(ok) => ok,
        Err(e) => {
            warn!(error = %e, "stored password hash is not a valid bcrypt hash");
            false
        }
    }
}
