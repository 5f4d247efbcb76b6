//! Error types for the dispatch core and its collaborators.

use std::path::PathBuf;

use thiserror::Error;

/// Failure modes surfaced to callers of [`ChannelManager::send`].
///
/// Everything else the core recovers from locally: stale sockets are deleted
/// and respawned, races to spawn are deduplicated, and a killed host is
/// respawned transparently on the next send.
///
/// [`ChannelManager::send`]: crate::manager::ChannelManager::send
#[derive(Debug, Error)]
pub enum SendError {
    /// No session host could be reached within the spawn deadline. The caller
    /// may retry; nothing is left half-connected.
    #[error("no session host reachable for channel {channel}")]
    HostUnreachable { channel: String },

    /// The host socket closed while the message was queued or in flight.
    /// The next send to the same channel reconnects or respawns.
    #[error("session host for channel {channel} disconnected")]
    ChannelDisconnected { channel: String },
}

/// Errors raised inside a session host process.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("invalid host configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),

    #[error("failed to bind socket {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to spawn agent binary {binary}: {source}")]
    AgentSpawn {
        binary: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
