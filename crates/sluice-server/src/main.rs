//! sluice server binary
//!
//! SSH + SFTP server over the sluice virtual filesystem.
//!
//! ## Usage
//!
//! ```bash
//! # Run the server (default)
//! sluice run --config ~/.config/sluice/sluice.toml
//!
//! # Where does a user's file live in their bucket?
//! sluice translate --username alice --password secret dir/report.csv
//!
//! # Hash a password for a [[users]] entry
//! echo -n secret | sluice hash-password
//! ```

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use sluice_kernel::{TranslateRequest, hash_password, translate_path};
use sluice_server::{MemoryObjects, ServerConfig, ServerState, SshServer, SshServerConfig};

/// SFTP server with a virtual filesystem over local disk and object storage.
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "SFTP server for sluice")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the SSH server
    Run {
        /// Config file (default: platform config dir)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the object key a user's path maps to
    Translate {
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
        filepath: String,
    },
    /// Hash a password (read from stdin when not given)
    HashPassword { password: Option<String> },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let result = match args.command.unwrap_or(Command::Run { config: None }) {
        Command::Run { config } => run_server(config).await,
        Command::Translate {
            config,
            username,
            password,
            filepath,
        } => cmd_translate(config, TranslateRequest::new(username, password, filepath)).await,
        Command::HashPassword { password } => cmd_hash_password(password),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<ServerConfig> {
    let path = path.unwrap_or_else(ServerConfig::default_path);
    ServerConfig::load(&path).with_context(|| format!("loading {}", path.display()))
}

async fn run_server(config: Option<PathBuf>) -> Result<ExitCode> {
    let config = load_config(config)?;
    let ssh = SshServerConfig::from_config(&config)?;
    let mut state = ServerState::new(config.open_store()?, config.settings.clone());
    if config.server.memory_object_store {
        tracing::warn!("object-store users are served from process memory");
        state = state.with_objects(Arc::new(MemoryObjects::new()));
    }

    tracing::info!(
        bind = %ssh.bind_addr,
        atomic_upload = config.settings.atomic_upload,
        quota_tracking = config.settings.quota_tracking,
        "Starting sluice server"
    );
    SshServer::new(ssh, state).run().await.context("server error")?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_translate(config: Option<PathBuf>, request: TranslateRequest) -> Result<ExitCode> {
    let config = load_config(config)?;
    let store = config.open_store()?;
    match translate_path(store.as_ref(), request).await {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("{} ({})", e, e.status());
            Ok(ExitCode::FAILURE)
        }
    }
}

fn cmd_hash_password(password: Option<String>) -> Result<ExitCode> {
    let password = match password {
        Some(p) => p,
        None => {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };
    if password.is_empty() {
        eprintln!("password is required");
        return Ok(ExitCode::FAILURE);
    }
    println!("{}", hash_password(&password)?);
    Ok(ExitCode::SUCCESS)
}
