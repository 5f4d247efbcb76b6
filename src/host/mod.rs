//! The session host: a detached, single-purpose process owning one agent
//! subprocess behind one local socket.
//!
//! The daemon spawns it with a single JSON configuration argument and never
//! waits for it; the PID file is the only link between daemon restarts and
//! the running host. The host survives until it receives SIGTERM, respawning
//! its agent (with resume) whenever a message arrives after an exit. SIGINT
//! is explicitly ignored; Ctrl+C at the daemon's terminal is the daemon's
//! business, not the host's.

pub mod agent;
mod runtime;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::signal::unix::{SignalKind, signal};

use crate::config::AgentCliConfig;
use crate::error::HostError;

pub use runtime::HostRuntime;

/// Everything a host needs, passed as one JSON argument on its command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub channel: String,
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    /// The host's own operational log; its stdio is disconnected.
    pub host_log: PathBuf,
    /// Per-channel capture of the agent's stderr.
    pub agent_stderr_log: PathBuf,
    pub workdir: PathBuf,
    pub agent: AgentCliConfig,
    /// Session identifier persisted by a previous daemon, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
}

impl HostConfig {
    pub fn from_json(raw: &str) -> Result<Self, HostError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Session-host process entry: write the PID file, listen, serve until
/// SIGTERM.
pub async fn run(config: HostConfig) -> Result<(), HostError> {
    std::fs::write(&config.pid_file, format!("{}\n", std::process::id()))?;
    tracing::info!(
        channel = %config.channel,
        socket = %config.socket_path.display(),
        "session host started"
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        loop {
            sigint.recv().await;
            tracing::debug!("ignoring SIGINT");
        }
    });

    let runtime = HostRuntime::new(config)?;
    runtime
        .run(async move {
            sigterm.recv().await;
        })
        .await
}
