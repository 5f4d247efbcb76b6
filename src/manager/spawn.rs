//! Connecting to a session host, spawning one when none answers.
//!
//! A channel's host may already be running from a previous daemon life; the
//! connect path tries its socket first and only spawns on failure. The spawn
//! is fully detached (no shared session, no controlling terminal, stdio
//! disconnected) and is never awaited; the PID file the host writes is the
//! only link back to it.

use std::process::Stdio;
use std::time::Instant;

use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::time::timeout;

use super::ManagerConfig;
use crate::error::SendError;
use crate::host::HostConfig;

/// Connect to the channel's host, reusing a live one or spawning fresh.
pub(crate) async fn connect_or_spawn(
    config: &ManagerConfig,
    channel: &str,
    resume_session_id: Option<String>,
) -> Result<UnixStream, SendError> {
    let socket_path = config.runtime.socket_path(channel);

    if socket_path.exists() {
        match timeout(
            config.timings.connect_timeout,
            UnixStream::connect(&socket_path),
        )
        .await
        {
            Ok(Ok(stream)) => {
                tracing::info!(channel, "reusing running session host");
                return Ok(stream);
            }
            _ => {
                tracing::info!(channel, "stale host socket, respawning");
                let _ = std::fs::remove_file(&socket_path);
            }
        }
    }

    if let Err(error) = std::fs::create_dir_all(&config.runtime.runtime_dir) {
        tracing::warn!(%error, "failed to create runtime directory");
    }

    let host_config = HostConfig {
        channel: channel.to_string(),
        socket_path: socket_path.clone(),
        pid_file: config.runtime.pid_file(channel),
        host_log: config.runtime.host_log(channel),
        agent_stderr_log: config.runtime.agent_stderr_log(channel),
        workdir: config.runtime.workdir.clone(),
        agent: config.agent.clone(),
        resume_session_id,
    };

    let spawned = Command::new(&config.host_program)
        .arg("session-host")
        .arg(host_config.to_json())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn();

    match spawned {
        // Dropped, never awaited: the host must outlive this daemon.
        Ok(child) => {
            tracing::info!(channel, pid = child.id().unwrap_or_default(), "session host spawned");
            drop(child);
        }
        Err(error) => {
            tracing::error!(channel, %error, "failed to spawn session host");
            return Err(SendError::HostUnreachable {
                channel: channel.to_string(),
            });
        }
    }

    // The host binds its socket once it is up; poll until the deadline.
    let deadline = Instant::now() + config.timings.spawn_deadline;
    loop {
        if let Ok(stream) = UnixStream::connect(&socket_path).await {
            return Ok(stream);
        }
        if Instant::now() >= deadline {
            tracing::error!(channel, "session host did not come up before the deadline");
            return Err(SendError::HostUnreachable {
                channel: channel.to_string(),
            });
        }
        tokio::time::sleep(config.timings.poll_interval).await;
    }
}
