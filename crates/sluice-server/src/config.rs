//! Server configuration file.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:2022"
//! host_key = "~/.config/sluice/host_ed25519"
//! idle_timeout_secs = 900
//!
//! [settings]
//! atomic_upload = true
//!
//! [store]
//! sqlite = "~/.local/share/sluice/users.db"
//!
//! [[users]]
//! username = "alice"
//! password = "secret"
//! home_dir = "/srv/sftp/alice"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sluice_kernel::store::PASSWORD_HASH_COST;
use sluice_kernel::{MemoryStore, Settings, SqliteStore, StoreError, User, UserStore, hash_password_with_cost};

use crate::constants::{CONFIG_FILE_NAME, DEFAULT_BIND_ADDRESS, DEFAULT_IDLE_TIMEOUT, DEFAULT_SSH_PORT};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid bind address: {0:?}")]
    BindAddress(String),

    #[error("failed to load host key {path}: {source}")]
    HostKey {
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },

    #[error("failed to generate host key: {0}")]
    KeyGeneration(String),

    #[error("user {0:?} has neither password nor password_hash")]
    MissingPassword(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub settings: Settings,
    pub store: StoreSection,
    pub users: Vec<SeedUser>,
}

/// `[server]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    /// OpenSSH private key; an ephemeral Ed25519 key is used when unset.
    pub host_key: Option<String>,
    /// 0 disables the idle timeout.
    pub idle_timeout_secs: u64,
    /// Serve object-store users from in-process buckets.
    pub memory_object_store: bool,
    /// bcrypt cost for `[[users]]` passwords given in plaintext.
    pub password_hash_cost: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: format!("{DEFAULT_BIND_ADDRESS}:{DEFAULT_SSH_PORT}"),
            host_key: None,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            memory_object_store: false,
            password_hash_cost: PASSWORD_HASH_COST,
        }
    }
}

/// `[store]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite database path; users live in memory when unset.
    pub sqlite: Option<String>,
}

/// A `[[users]]` entry: a full user record plus an optional plaintext
/// password that is hashed on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(flatten)]
    pub user: User,
}

impl ServerConfig {
    /// `$XDG_CONFIG_HOME/sluice/sluice.toml` or the platform equivalent.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sluice")
            .join(CONFIG_FILE_NAME)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind
            .parse()
            .map_err(|_| ConfigError::BindAddress(self.server.bind.clone()))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.server.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn host_key_path(&self) -> Option<PathBuf> {
        self.server.host_key.as_deref().map(expand)
    }

    /// Seed users with home directories expanded and passwords hashed.
    pub fn seed_users(&self) -> Result<Vec<User>, ConfigError> {
        self.users
            .iter()
            .map(|seed| {
                let mut user = seed.user.clone();
                if let Some(password) = &seed.password {
                    user.password_hash = hash_password_with_cost(password, self.server.password_hash_cost)?;
                } else if user.password_hash.is_empty() {
                    return Err(ConfigError::MissingPassword(user.username));
                }
                user.home_dir = expand(&user.home_dir.to_string_lossy());
                for folder in &mut user.virtual_folders {
                    folder.mapped_path = expand(&folder.mapped_path.to_string_lossy());
                }
                Ok(user)
            })
            .collect()
    }

    /// Open the configured user store and write the seed users into it.
    pub fn open_store(&self) -> Result<Arc<dyn UserStore>, ConfigError> {
        let users = self.seed_users()?;
        match self.store.sqlite.as_deref() {
            Some(path) => {
                let path = expand(path);
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir).map_err(|source| ConfigError::Read {
                        path: dir.to_path_buf(),
                        source,
                    })?;
                }
                let store = SqliteStore::open(&path)?;
                for user in &users {
                    store.upsert_user(user)?;
                }
                tracing::info!(path = %path.display(), seeded = users.len(), "opened user database");
                Ok(Arc::new(store))
            }
            None => {
                let store = MemoryStore::new();
                for user in users {
                    store.add_user(user);
                }
                Ok(Arc::new(store))
            }
        }
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_kernel::{FilesystemProvider, Permission, verify_password};

    const SAMPLE: &str = r#"
[server]
bind = "0.0.0.0:2222"
idle_timeout_secs = 0
password_hash_cost = 4

[settings]
atomic_upload = true

[settings.retry]
max_retries = 5

[[users]]
username = "alice"
password = "secret"
home_dir = "/srv/alice"
quota_size = 1048576
folder_prefix = "/incoming"

[users.permissions]
"/" = ["list", "download"]
"/incoming" = ["*"]

[[users]]
username = "bob"
password_hash = "precomputed"
home_dir = "/srv/bob"

[users.filesystem]
provider = "s3"

[users.filesystem.s3]
bucket = "uploads"
key_prefix = "users/bob/"
region = "eu-west-1"
"#;

    #[test]
    fn test_parse_sample() {
        let config = ServerConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.bind_addr().unwrap().port(), 2222);
        assert_eq!(config.idle_timeout(), None);
        assert!(config.settings.atomic_upload);
        assert!(config.settings.quota_tracking);
        assert_eq!(config.settings.retry.max_retries, 5);
        assert_eq!(config.settings.retry.min_delay_ms, 30);

        let users = config.seed_users().unwrap();
        assert_eq!(users.len(), 2);
        let alice = &users[0];
        assert!(verify_password("secret", &alice.password_hash));
        assert_eq!(alice.quota_size, 1_048_576);
        assert_eq!(alice.folder_prefix, "/incoming");
        assert!(alice.has_perm(Permission::Download, "/docs"));
        assert!(!alice.has_perm(Permission::Upload, "/docs"));
        assert!(alice.has_perm(Permission::Upload, "/incoming/x"));

        let bob = &users[1];
        assert_eq!(bob.password_hash, "precomputed");
        assert_eq!(bob.filesystem.provider, FilesystemProvider::S3);
        assert_eq!(bob.filesystem.s3.bucket, "uploads");
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.bind_addr().unwrap().port(), DEFAULT_SSH_PORT);
        assert_eq!(config.idle_timeout(), Some(DEFAULT_IDLE_TIMEOUT));
        assert!(config.host_key_path().is_none());
        assert!(config.users.is_empty());
        assert!(!config.settings.atomic_upload);
        assert_eq!(config.server.password_hash_cost, PASSWORD_HASH_COST);
    }

    #[test]
    fn test_invalid_values() {
        let mut config = ServerConfig::default();
        config.server.bind = "not an address".into();
        assert!(matches!(config.bind_addr(), Err(ConfigError::BindAddress(_))));

        let config = ServerConfig::parse("[[users]]\nusername = \"nopw\"\n").unwrap();
        assert!(matches!(config.seed_users(), Err(ConfigError::MissingPassword(name)) if name == "nopw"));

        assert!(matches!(
            ServerConfig::parse("[server]\nbind = 12"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_open_store_seeds_users() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("nested").join("users.db");
        let mut config = ServerConfig::parse(SAMPLE).unwrap();

        let memory = config.open_store().unwrap();
        assert!(memory.check_credentials("alice", "secret").await.is_ok());

        config.store.sqlite = Some(db.to_string_lossy().into_owned());
        let sqlite = config.open_store().unwrap();
        assert!(db.exists());
        assert!(sqlite.check_credentials("alice", "secret").await.is_ok());
        assert!(matches!(
            sqlite.check_credentials("alice", "nope").await,
            Err(StoreError::InvalidCredentials)
        ));
    }
}
