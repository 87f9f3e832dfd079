//! SSH server for sluice
//!
//! Accepts SSH connections, authenticates passwords against the user store
//! and hosts the SFTP subsystem on session channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use sluice_kernel::{Connection, ObjectClientFactory, QuotaManager, Settings, User, UserStore, VfsResult, build_fs};

use crate::config::{ConfigError, ServerConfig};
use crate::constants::SSH_AUTH_REJECTION_DELAY;
use crate::sftp::SftpSession;

/// SSH server configuration
#[derive(Clone)]
pub struct SshServerConfig {
    pub bind_addr: SocketAddr,
    pub host_key: PrivateKey,
    pub idle_timeout: Option<Duration>,
}

impl SshServerConfig {
    /// Create config with an ephemeral key (for testing)
    pub fn ephemeral(port: u16) -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            host_key: ephemeral_key()?,
            idle_timeout: None,
        })
    }

    /// Bind address, host key and timeout from the `[server]` section.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        let host_key = match config.host_key_path() {
            Some(path) => russh::keys::load_secret_key(&path, None)
                .map_err(|source| ConfigError::HostKey { path, source })?,
            None => {
                warn!("no host key configured, using an ephemeral key");
                ephemeral_key()?
            }
        };
        Ok(Self {
            bind_addr: config.bind_addr()?,
            host_key,
            idle_timeout: config.idle_timeout(),
        })
    }
}

fn ephemeral_key() -> Result<PrivateKey, ConfigError> {
    PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)
        .map_err(|e| ConfigError::KeyGeneration(e.to_string()))
}

/// State shared by every session.
pub struct ServerState {
    pub store: Arc<dyn UserStore>,
    pub settings: Settings,
    /// Object-store clients; object-store users are refused without one.
    pub objects: Option<Arc<dyn ObjectClientFactory>>,
}

impl ServerState {
    pub fn new(store: Arc<dyn UserStore>, settings: Settings) -> Self {
        Self {
            store,
            settings,
            objects: None,
        }
    }

    pub fn with_objects(mut self, objects: Arc<dyn ObjectClientFactory>) -> Self {
        self.objects = Some(objects);
        self
    }

    /// Open a kernel connection for an authenticated user.
    pub fn connect(&self, user: User, remote: Option<SocketAddr>, client_version: &str) -> VfsResult<Connection> {
        let fs = build_fs(&user, &self.settings, self.objects.as_deref())?;
        let quota = QuotaManager::new(self.store.clone(), self.settings.quota_tracking);
        Ok(Connection::new(user, fs, quota, self.settings.clone()).with_remote(remote, client_version))
    }
}

/// SSH server
pub struct SshServer {
    config: SshServerConfig,
    state: Arc<ServerState>,
}

impl SshServer {
    pub fn new(config: SshServerConfig, state: ServerState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Run the SSH server
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let config = russh::server::Config {
            auth_rejection_time: SSH_AUTH_REJECTION_DELAY,
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: self.config.idle_timeout,
            keys: vec![self.config.host_key.clone()],
            ..Default::default()
        };

        info!("Starting SSH server on {}", self.config.bind_addr);

        let mut server = Server {
            state: self.state.clone(),
        };
        let socket = TcpListener::bind(self.config.bind_addr).await?;

        server
            .run_on_socket(Arc::new(config), &socket)
            .await
            .map_err(std::io::Error::other)
    }
}

/// Server factory - creates handlers for each connection
struct Server {
    state: Arc<ServerState>,
}

impl server::Server for Server {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        ConnectionHandler::new(self.state.clone(), peer_addr)
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        error!("Session error: {:?}", error);
    }
}

/// Handler for a single SSH connection
struct ConnectionHandler {
    state: Arc<ServerState>,
    peer_addr: Option<SocketAddr>,
    user: Option<User>,
    channels: HashMap<ChannelId, Channel<Msg>>,
    sftp_channel: Option<ChannelId>,
    connection: Option<Arc<Connection>>,
}

impl ConnectionHandler {
    fn new(state: Arc<ServerState>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            state,
            peer_addr,
            user: None,
            channels: HashMap::new(),
            sftp_channel: None,
            connection: None,
        }
    }

    /// Close the kernel connection, aborting transfers still in flight.
    fn release(&mut self) {
        let Some(conn) = self.connection.take() else {
            return;
        };
        self.sftp_channel = None;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(conn = conn.id(), "no runtime to close connection on");
            return;
        };
        runtime.spawn(async move {
            let idle = conn.idle_time();
            if let Err(e) = conn.close().await {
                warn!(conn = conn.id(), error = %e, "error closing connection");
            }
            debug!(conn = conn.id(), idle_ms = idle.as_millis() as u64, "sftp session released");
        });
    }
}

impl server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.state.store.check_credentials(user, password).await {
            Ok(account) => {
                info!(user, peer = ?self.peer_addr, "password accepted");
                self.user = Some(account);
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!(user, peer = ?self.peer_addr, error = %e, "authentication failed");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Channel {} opened", channel.id());
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" || self.connection.is_some() {
            warn!("Refusing subsystem {:?} on channel {}", name, channel_id);
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        let (Some(user), Some(channel)) = (self.user.clone(), self.channels.remove(&channel_id)) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        let client_version = String::from_utf8_lossy(session.remote_sshid()).into_owned();
        let conn = match self.state.connect(user, self.peer_addr, &client_version) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                warn!(error = %e, "unable to open filesystem");
                session.channel_failure(channel_id)?;
                return Ok(());
            }
        };
        info!(
            conn = conn.id(),
            user = %conn.user().username,
            provider = %conn.fs().provider(),
            "sftp session started"
        );

        self.connection = Some(conn.clone());
        self.sftp_channel = Some(channel_id);
        session.channel_success(channel_id)?;
        russh_sftp::server::run(channel.into_stream(), SftpSession::new(conn)).await;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel {} closed", channel);
        self.channels.remove(&channel);
        if self.sftp_channel == Some(channel) {
            self.release();
        }
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.release();
    }
}
