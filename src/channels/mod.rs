//! Transport adapters.
//!
//! Adapters own their protocol's session boundary and nothing else: derive a
//! channel key, call [`ChannelManager::send`], and optionally register an
//! outbound handler with the [`PushRegistry`]. The dispatch core never knows
//! which transport a message came from.
//!
//! [`ChannelManager::send`]: crate::manager::ChannelManager::send
//! [`PushRegistry`]: crate::push::PushRegistry

pub mod http;
pub mod telegram;

pub use http::serve as serve_http;
pub use telegram::TelegramChannel;
