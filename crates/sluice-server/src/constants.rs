//! Server configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default SSH port for the sluice server.
pub const DEFAULT_SSH_PORT: u16 = 2022;

/// Default bind address (localhost only).
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// Idle sessions are dropped after this long without traffic.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// SSH authentication rejection delay (prevents timing attacks).
pub const SSH_AUTH_REJECTION_DELAY: Duration = Duration::from_secs(1);

/// Open handles allowed per SFTP session.
pub const SFTP_HANDLE_LIMIT: usize = 64;

/// Default config file name under the user's config directory.
pub const CONFIG_FILE_NAME: &str = "sluice.toml";
