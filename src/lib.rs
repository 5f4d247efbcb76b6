//! clawmux is a local daemon that multiplexes heterogeneous chat channels
//! onto persistent interactive Claude Code sessions.
//!
//! Each conversation ("channel", an opaque string key) is bound to one
//! long-running `claude` subprocess owned by a detached session host that
//! survives daemon restarts. The [`manager::ChannelManager`] serializes
//! dispatch per channel over the host's line-delimited JSON socket, coalesces
//! backlogged text messages into combined turns, and persists agent session
//! identifiers so conversations resume across process deaths. The
//! [`push::PushRegistry`] is the agent-bypassing outbound path.

pub mod channels;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod host;
pub mod manager;
pub mod protocol;
pub mod push;
pub mod sessions;

pub use config::Config;
pub use error::SendError;
pub use manager::{ChannelManager, EventSink, TurnResult};
pub use protocol::{AgentEvent, ChannelContext, MessageContent};
pub use push::{PushHandler, PushMedia, PushRegistry};
pub use sessions::SessionStore;
