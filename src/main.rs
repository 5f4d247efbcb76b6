//! clawmux entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use clawmux::cli::{Cli, Command};
use clawmux::config::Config;
use clawmux::host::{self, HostConfig};
use clawmux::manager::{ChannelManager, ManagerConfig};
use clawmux::sessions::SessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::SessionHost { config }) => run_session_host(&config).await,
        Some(Command::Send { channel, message }) => run_send(&channel, &message).await,
        None | Some(Command::Run) => run_daemon().await,
    }
}

async fn run_daemon() -> anyhow::Result<()> {
    init_tracing("clawmux=info");
    let config = Config::from_env()?;
    tracing::info!("starting clawmux daemon");
    clawmux::daemon::run(config).await
}

/// One-shot local client: drives the manager directly for a single turn.
async fn run_send(channel: &str, message: &str) -> anyhow::Result<()> {
    init_tracing("clawmux=warn");
    let config = Config::from_env()?;
    let sessions = SessionStore::load(&config.runtime.session_file);
    let manager = ChannelManager::new(ManagerConfig::from_config(&config), sessions);

    let result = manager.send(channel, message, None, None).await?;
    manager.shutdown().await;

    if result.is_error {
        anyhow::bail!("{}", result.text);
    }
    println!("{}", result.text);
    Ok(())
}

/// Detached session host: stdio is disconnected, so tracing goes to the
/// per-channel log file from the host configuration.
async fn run_session_host(raw: &str) -> anyhow::Result<()> {
    let config = HostConfig::from_json(raw)?;

    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.host_log)?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clawmux=info")),
        )
        .with_writer(Arc::new(log))
        .with_ansi(false)
        .init();

    host::run(config).await?;
    Ok(())
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}
