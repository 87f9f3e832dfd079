//! Kernel settings and per-user filesystem configuration.
//!
//! Everything here is plain serde data so it can be embedded in the
//! server's TOML file or stored as JSON in the user store.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use strum::EnumString;

/// Storage provider a user's files live on.
///
/// Serializes to the lowercase wire names; an unknown name parses to
/// [`FilesystemProvider::Invalid`], which serializes as the empty string.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, EnumString, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FilesystemProvider {
    #[default]
    #[strum(serialize = "local")]
    Local,
    #[strum(serialize = "s3")]
    S3,
    #[strum(serialize = "gcs")]
    Gcs,
    #[strum(serialize = "azure")]
    Azure,
    #[strum(serialize = "sftp")]
    Sftp,
    #[strum(serialize = "local-encrypted")]
    LocalEncrypted,
    #[strum(disabled)]
    Invalid,
}

impl FilesystemProvider {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilesystemProvider::Local => "local",
            FilesystemProvider::S3 => "s3",
            FilesystemProvider::Gcs => "gcs",
            FilesystemProvider::Azure => "azure",
            FilesystemProvider::Sftp => "sftp",
            FilesystemProvider::LocalEncrypted => "local-encrypted",
            FilesystemProvider::Invalid => "",
        }
    }

    /// Object-store providers address files as bucket + key.
    pub fn is_object_store(&self) -> bool {
        matches!(
            self,
            FilesystemProvider::S3 | FilesystemProvider::Gcs | FilesystemProvider::Azure
        )
    }
}

impl From<String> for FilesystemProvider {
    fn from(s: String) -> Self {
        FilesystemProvider::from_str(&s).unwrap_or(FilesystemProvider::Invalid)
    }
}

impl From<FilesystemProvider> for String {
    fn from(p: FilesystemProvider) -> Self {
        p.as_str().to_string()
    }
}

impl std::fmt::Display for FilesystemProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket-addressed object store settings (S3, GCS).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    /// Key prefix all of the user's objects are confined under.
    pub key_prefix: String,
    pub region: String,
    pub endpoint: String,
    /// Name of the credential entry; the secret itself lives elsewhere.
    pub credentials: String,
}

/// Azure Blob settings. The container plays the bucket's role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub container: String,
    pub key_prefix: String,
    pub account_name: String,
    pub endpoint: String,
    pub credentials: String,
}

/// Proxied remote SFTP settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SftpConfig {
    pub endpoint: String,
    pub username: String,
    pub prefix: String,
    pub credentials: String,
}

/// Local encrypted filesystem settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptConfig {
    pub passphrase_ref: String,
}

/// Which backend a user is on, plus the parameters of every kind.
///
/// Only the section matching `provider` is read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    pub provider: FilesystemProvider,
    pub s3: ObjectStoreConfig,
    pub gcs: ObjectStoreConfig,
    pub azure: AzureConfig,
    pub sftp: SftpConfig,
    pub crypt: CryptConfig,
}

impl FilesystemConfig {
    /// A local-disk configuration.
    pub fn local() -> Self {
        Self::default()
    }

    /// An S3 configuration.
    pub fn s3(bucket: impl Into<String>, key_prefix: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            provider: FilesystemProvider::S3,
            s3: ObjectStoreConfig {
                bucket: bucket.into(),
                key_prefix: key_prefix.into(),
                region: region.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// A GCS configuration.
    pub fn gcs(bucket: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        Self {
            provider: FilesystemProvider::Gcs,
            gcs: ObjectStoreConfig {
                bucket: bucket.into(),
                key_prefix: key_prefix.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// An Azure Blob configuration.
    pub fn azure(container: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        Self {
            provider: FilesystemProvider::Azure,
            azure: AzureConfig {
                container: container.into(),
                key_prefix: key_prefix.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Key prefix for object-store providers, `None` otherwise.
    pub fn key_prefix(&self) -> Option<&str> {
        match self.provider {
            FilesystemProvider::S3 => Some(&self.s3.key_prefix),
            FilesystemProvider::Gcs => Some(&self.gcs.key_prefix),
            FilesystemProvider::Azure => Some(&self.azure.key_prefix),
            _ => None,
        }
    }
}

/// Retry settings for remote storage calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay_ms: 30,
            max_delay_ms: 300_000,
        }
    }
}

impl RetryConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Process-wide kernel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Upload to a temporary sibling and rename on success.
    pub atomic_upload: bool,
    /// Track and enforce quota usage.
    pub quota_tracking: bool,
    pub retry: RetryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            atomic_upload: false,
            quota_tracking: true,
            retry: RetryConfig::default(),
        }
    }
}

impl Settings {
    /// Builder: enable atomic uploads.
    pub fn with_atomic_upload(mut self, enabled: bool) -> Self {
        self.atomic_upload = enabled;
        self
    }

    /// Builder: toggle quota tracking.
    pub fn with_quota_tracking(mut self, enabled: bool) -> Self {
        self.quota_tracking = enabled;
        self
    }
}
