//! Daemon lifecycle: adapter wiring and signal-driven shutdown.
//!
//! Three ways out, all signal-driven. SIGUSR2 or SIGTERM disconnect from the
//! session hosts and exit, leaving the hosts (and their agents) running for
//! the next daemon to reattach; that is the hot-reload path. SIGINT is the
//! interactive full stop: hosts are terminated too. SIGHUP restarts in
//! place: disconnect, close listeners, re-exec the same binary with the same
//! arguments as a detached child.

use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

use crate::channels::{TelegramChannel, serve_http};
use crate::config::Config;
use crate::manager::{ChannelManager, ManagerConfig};
use crate::push::PushRegistry;
use crate::sessions::SessionStore;

/// Grace period for listener close during a SIGHUP restart.
const RESTART_CLOSE_GRACE: Duration = Duration::from_secs(5);

enum Lifecycle {
    /// Disconnect from hosts, exit. Hosts keep running.
    Disconnect,
    /// Disconnect and SIGTERM every known host.
    FullShutdown,
    /// Disconnect, close listeners, re-exec detached.
    Restart,
}

/// Run the daemon until a lifecycle signal arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let sessions = SessionStore::load(&config.runtime.session_file);
    tracing::info!(
        known_channels = sessions.channels().len(),
        session_file = %config.runtime.session_file.display(),
        "session record loaded"
    );

    let manager = ChannelManager::new(ManagerConfig::from_config(&config), sessions);
    let push = PushRegistry::new();

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut adapters: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    if let Some(http) = &config.http {
        let (addr, handle) =
            serve_http(http, manager.clone(), push.clone(), stop_rx.clone()).await?;
        tracing::info!(%addr, "http adapter listening");
        adapters.push(handle);
    }
    if let Some(telegram) = &config.telegram {
        let channel = TelegramChannel::new(telegram.clone(), manager.clone());
        push.register("tg-", channel.push_handler());
        adapters.push(tokio::spawn(channel.run(stop_rx.clone())));
        tracing::info!("telegram adapter enabled");
    }
    if adapters.is_empty() {
        tracing::warn!("no transport adapters configured; only signals will reach this daemon");
    }

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    let lifecycle = tokio::select! {
        _ = sigint.recv() => {
            tracing::info!("SIGINT: full shutdown including session hosts");
            Lifecycle::FullShutdown
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM: disconnecting, hosts keep running");
            Lifecycle::Disconnect
        }
        _ = sigusr2.recv() => {
            tracing::info!("SIGUSR2: hot reload, hosts keep running");
            Lifecycle::Disconnect
        }
        _ = sighup.recv() => {
            tracing::info!("SIGHUP: restarting in place");
            Lifecycle::Restart
        }
    };

    let _ = stop_tx.send(true);

    match lifecycle {
        Lifecycle::Disconnect => manager.shutdown().await,
        Lifecycle::FullShutdown => manager.shutdown_hosts().await,
        Lifecycle::Restart => {
            manager.shutdown().await;
            close_adapters(adapters, RESTART_CLOSE_GRACE).await;
            respawn_self()?;
        }
    }

    tracing::info!("daemon exiting");
    Ok(())
}

/// Await adapter tasks up to `grace`, then give up so the restart cannot
/// hang on a listener that never closes.
async fn close_adapters(adapters: Vec<tokio::task::JoinHandle<()>>, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    for handle in adapters {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if tokio::time::timeout(remaining, handle).await.is_err() {
            tracing::warn!("listener close timed out, forcing restart");
            return;
        }
    }
}

/// Re-exec this binary with the same arguments as a detached child: new
/// process group, stdio disconnected, never awaited.
fn respawn_self() -> std::io::Result<()> {
    use std::os::unix::process::CommandExt as _;

    let exe = std::env::current_exe()?;
    let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();
    let child = std::process::Command::new(&exe)
        .args(&args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .process_group(0)
        .spawn()?;
    tracing::info!(pid = child.id(), "replacement daemon spawned");
    Ok(())
}
