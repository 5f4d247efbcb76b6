//! Outbound push registry.
//!
//! Prefix-keyed table of handlers supplied by transport adapters at startup.
//! Pushes bypass the agent entirely: a scheduled job (or the agent itself)
//! hands the registry a channel and text, and the first handler whose prefix
//! matches delivers it through the transport's native path. The registry
//! knows nothing about agent sessions or the dispatch path.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

/// Optional media attachment for a push.
#[derive(Debug, Clone)]
pub struct PushMedia {
    pub media_type: String,
    pub base64_data: String,
}

/// Transport-native delivery of an outbound message.
#[async_trait]
pub trait PushHandler: Send + Sync {
    /// Returns true when the message was delivered.
    async fn deliver(&self, channel: &str, text: &str, media: Option<&PushMedia>) -> bool;
}

/// Ordered prefix → handler mapping. Last writer wins per prefix.
#[derive(Clone, Default)]
pub struct PushRegistry {
    entries: Arc<RwLock<Vec<(String, Arc<dyn PushHandler>)>>>,
}

impl PushRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every channel starting with `prefix`.
    /// Re-registering a prefix replaces the previous handler in place.
    pub fn register(&self, prefix: impl Into<String>, handler: Arc<dyn PushHandler>) {
        let prefix = prefix.into();
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        if let Some(entry) = entries.iter_mut().find(|(p, _)| *p == prefix) {
            entry.1 = handler;
        } else {
            entries.push((prefix, handler));
        }
    }

    /// Dispatch to the first handler whose prefix leads the channel.
    /// Returns false when no prefix matches; callers map that to a 404.
    pub async fn send(&self, channel: &str, text: &str, media: Option<&PushMedia>) -> bool {
        let handler = {
            let Ok(entries) = self.entries.read() else {
                return false;
            };
            entries
                .iter()
                .find(|(prefix, _)| channel.starts_with(prefix.as_str()))
                .map(|(_, handler)| handler.clone())
        };

        match handler {
            Some(handler) => handler.deliver(channel, text, media).await,
            None => {
                tracing::debug!(channel, "push with no matching prefix");
                false
            }
        }
    }
}
