//! sluice server library
//!
//! SSH + SFTP front end for the sluice kernel.

pub mod config;
pub mod constants;
pub mod objects;
pub mod sftp;
pub mod ssh;

pub use config::{ConfigError, ServerConfig};
pub use objects::MemoryObjects;
pub use sftp::SftpSession;
pub use ssh::{ServerState, SshServer, SshServerConfig};
