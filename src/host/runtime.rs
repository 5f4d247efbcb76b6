//! Session-host event loop.
//!
//! One agent subprocess, one local socket, at most one client. Lines from the
//! agent's stdout are forwarded verbatim to the client (after a minimal parse
//! to capture the session identifier); lines from the client go to the
//! agent's stdin, or into a replay buffer while the agent is dead. A new
//! client connection replaces the old one without touching the agent, which
//! is how a restarted daemon reattaches.

use std::io::Write as _;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, oneshot};

use super::HostConfig;
use super::agent::{
    STDERR_TRUNCATE_BYTES, is_noisy_stderr, spawn_agent, truncate_bytes,
};
use crate::error::HostError;
use crate::protocol::{ClientFrame, session_ended_frame, stderr_frame};

/// Events produced by the agent pump task.
enum PumpEvent {
    Stdout(String),
    Stderr(String),
    /// Sent strictly after the final stdout/stderr lines of that agent.
    Exited { generation: u64, code: Option<i32> },
}

/// Minimal probe of an agent stdout line: just enough to spot
/// `{type: result, session_id}` for resume bookkeeping.
#[derive(serde::Deserialize)]
struct StdoutProbe {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

struct LiveAgent {
    generation: u64,
    pid: u32,
    stdin: ChildStdin,
    // Dropping this asks the pump task to kill the child.
    kill_tx: oneshot::Sender<()>,
}

struct Client {
    writer: OwnedWriteHalf,
    reader_task: tokio::task::JoinHandle<()>,
}

pub struct HostRuntime {
    config: HostConfig,
    listener: UnixListener,
    stderr_log: std::fs::File,

    agent: Option<LiveAgent>,
    generation: u64,
    last_session_id: Option<String>,
    /// Client lines received while the agent is dead, replayed in order
    /// into the next agent's stdin.
    pending: Vec<String>,

    client: Option<Client>,
    client_tx: mpsc::Sender<String>,
    client_rx: mpsc::Receiver<String>,
    pump_tx: mpsc::Sender<PumpEvent>,
    pump_rx: mpsc::Receiver<PumpEvent>,
}

impl HostRuntime {
    /// Bind the socket and prepare runtime state. Deletes any stale socket
    /// file first; the PID file is written by the caller.
    pub fn new(config: HostConfig) -> Result<Self, HostError> {
        if config.socket_path.exists() {
            std::fs::remove_file(&config.socket_path)?;
        }
        let listener =
            UnixListener::bind(&config.socket_path).map_err(|source| HostError::Bind {
                path: config.socket_path.clone(),
                source,
            })?;

        let stderr_log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.agent_stderr_log)?;

        let (client_tx, client_rx) = mpsc::channel(256);
        let (pump_tx, pump_rx) = mpsc::channel(256);

        let last_session_id = config.resume_session_id.clone();
        Ok(Self {
            config,
            listener,
            stderr_log,
            agent: None,
            generation: 0,
            last_session_id,
            pending: Vec::new(),
            client: None,
            client_tx,
            client_rx,
            pump_tx,
            pump_rx,
        })
    }

    /// Run until `shutdown` resolves, then kill the agent and clean up the
    /// socket and PID files.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), HostError>
    where
        F: std::future::Future<Output = ()>,
    {
        self.spawn_agent_now()?;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => self.replace_client(stream),
                    Err(error) => tracing::warn!(%error, "socket accept failed"),
                },
                event = self.pump_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_pump_event(event).await;
                    }
                }
                line = self.client_rx.recv() => {
                    if let Some(line) = line {
                        self.handle_client_line(line).await;
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        self.terminate().await;
        Ok(())
    }

    /// A new connection replaces (and destroys) any existing client without
    /// disturbing the agent.
    fn replace_client(&mut self, stream: UnixStream) {
        if let Some(old) = self.client.take() {
            tracing::info!(channel = %self.config.channel, "client replaced by new connection");
            old.reader_task.abort();
        } else {
            tracing::info!(channel = %self.config.channel, "client connected");
        }

        let (read_half, writer) = stream.into_split();
        let tx = self.client_tx.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        self.client = Some(Client {
            writer,
            reader_task,
        });
    }

    async fn handle_pump_event(&mut self, event: PumpEvent) {
        match event {
            PumpEvent::Stdout(line) => {
                if let Ok(probe) = serde_json::from_str::<StdoutProbe>(&line)
                    && probe.kind.as_deref() == Some("result")
                    && let Some(session_id) = probe.session_id
                {
                    tracing::debug!(channel = %self.config.channel, %session_id, "session identifier captured");
                    self.last_session_id = Some(session_id);
                }
                self.send_to_client(&line).await;
            }
            PumpEvent::Stderr(line) => {
                let stamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
                if let Err(error) = writeln!(self.stderr_log, "{stamp} {line}") {
                    tracing::warn!(%error, "failed to append agent stderr log");
                }
                if !is_noisy_stderr(&line) {
                    let frame = stderr_frame(truncate_bytes(&line, STDERR_TRUNCATE_BYTES));
                    self.send_to_client(&frame).await;
                }
            }
            PumpEvent::Exited { generation, code } => {
                let live = self.agent.as_ref().map(|a| a.generation) == Some(generation);
                if !live {
                    return;
                }
                self.agent = None;
                let code = code.unwrap_or(-1);
                tracing::warn!(channel = %self.config.channel, code, "agent exited");
                if self.client.is_some() {
                    // Lets an in-flight dispatch complete cleanly; the next
                    // inbound message triggers the respawn.
                    self.send_to_client(&session_ended_frame(code)).await;
                }
            }
        }
    }

    async fn handle_client_line(&mut self, line: String) {
        if let Ok(ClientFrame::Interrupt) = serde_json::from_str::<ClientFrame>(&line) {
            if let Some(agent) = &self.agent {
                tracing::info!(channel = %self.config.channel, "forwarding interrupt to agent");
                unsafe {
                    libc::kill(agent.pid as libc::pid_t, libc::SIGINT);
                }
            }
            return;
        }

        if self.agent.is_none() {
            self.pending.push(line);
            match self.spawn_agent_now() {
                Ok(()) => {
                    tracing::info!(
                        channel = %self.config.channel,
                        buffered = self.pending.len(),
                        "agent respawned, replaying buffer"
                    );
                    self.flush_pending().await;
                }
                Err(error) => {
                    tracing::error!(%error, "agent respawn failed, message stays buffered");
                }
            }
            return;
        }
        self.write_to_agent(line).await;
    }

    async fn write_to_agent(&mut self, line: String) -> bool {
        let Some(agent) = &mut self.agent else {
            self.pending.push(line);
            return false;
        };
        let write = async {
            agent.stdin.write_all(line.as_bytes()).await?;
            agent.stdin.write_all(b"\n").await
        };
        if let Err(error) = write.await {
            tracing::warn!(%error, "agent stdin write failed, buffering line");
            // Front of the buffer so replay order is preserved.
            self.pending.insert(0, line);
            return false;
        }
        true
    }

    /// Spawn the agent (resuming when an identifier is known), then replay
    /// any lines buffered while it was dead.
    fn spawn_agent_now(&mut self) -> Result<(), HostError> {
        self.generation += 1;
        let generation = self.generation;

        let spawned = spawn_agent(
            &self.config.agent,
            &self.config.workdir,
            self.last_session_id.as_deref(),
        )?;

        let (kill_tx, kill_rx) = oneshot::channel();
        self.agent = Some(LiveAgent {
            generation,
            pid: spawned.pid,
            stdin: spawned.stdin,
            kill_tx,
        });

        spawn_pump(
            spawned.child,
            spawned.stdout,
            spawned.stderr,
            generation,
            self.pump_tx.clone(),
            kill_rx,
        );
        Ok(())
    }

    async fn flush_pending(&mut self) {
        while !self.pending.is_empty() && self.agent.is_some() {
            let line = self.pending.remove(0);
            if !self.write_to_agent(line).await {
                break;
            }
        }
    }

    async fn send_to_client(&mut self, line: &str) {
        let Some(client) = &mut self.client else {
            return;
        };
        let write = async {
            client.writer.write_all(line.as_bytes()).await?;
            client.writer.write_all(b"\n").await
        };
        if let Err(error) = write.await {
            tracing::info!(%error, "client write failed, dropping connection");
            if let Some(client) = self.client.take() {
                client.reader_task.abort();
            }
        }
    }

    async fn terminate(&mut self) {
        tracing::info!(channel = %self.config.channel, "session host terminating");
        if let Some(agent) = self.agent.take() {
            // Synchronous kill: this process exits right after, so the pump
            // task cannot be relied on to deliver the signal in time.
            unsafe {
                libc::kill(agent.pid as libc::pid_t, libc::SIGTERM);
            }
            let _ = agent.kill_tx.send(());
        }
        if let Some(client) = self.client.take() {
            client.reader_task.abort();
        }
        let _ = std::fs::remove_file(&self.config.socket_path);
        let _ = std::fs::remove_file(&self.config.pid_file);
    }
}

/// Drive one agent's stdio. The `Exited` event is sent only after stdout and
/// stderr reach EOF, so no output line can arrive after it.
fn spawn_pump(
    child: tokio::process::Child,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    generation: u64,
    tx: mpsc::Sender<PumpEvent>,
    kill_rx: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut child = child;
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let mut kill_rx = kill_rx;
        let mut out_open = true;
        let mut err_open = true;
        let mut kill_armed = true;

        while out_open || err_open {
            tokio::select! {
                line = stdout.next_line(), if out_open => match line {
                    Ok(Some(line)) => {
                        let _ = tx.send(PumpEvent::Stdout(line)).await;
                    }
                    _ => out_open = false,
                },
                line = stderr.next_line(), if err_open => match line {
                    Ok(Some(line)) => {
                        let _ = tx.send(PumpEvent::Stderr(line)).await;
                    }
                    _ => err_open = false,
                },
                _ = &mut kill_rx, if kill_armed => {
                    kill_armed = false;
                    let _ = child.start_kill();
                }
            }
        }

        let code = child.wait().await.ok().and_then(|status| status.code());
        let _ = tx.send(PumpEvent::Exited { generation, code }).await;
    });
}
