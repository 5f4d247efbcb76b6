//! Wire types shared between the channel manager, the session host, and the
//! agent subprocess.
//!
//! Everything on the host socket is line-delimited JSON (LF-terminated).
//! Client-to-host frames are [`ClientFrame`]; host-to-client frames are
//! verbatim agent stdout lines plus the internal `_stderr` event. The core
//! parses agent lines only as far as the small [`AgentEvent`] envelope needed
//! for dispatch bookkeeping; the rest of each event is carried through
//! untouched.

use serde::{Deserialize, Serialize};

/// Event type reserved for agent stderr lines mirrored to the client.
/// Never surfaced to `on_event` as a semantic event.
pub const STDERR_EVENT: &str = "_stderr";

/// Event type of the terminal line of a dispatch.
pub const RESULT_EVENT: &str = "result";

/// Message content: a plain string or an ordered sequence of typed blocks.
/// Only plain-text content is eligible for coalescing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Plain-text contents coalesce; anything with blocks does not.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Blocks(_) => None,
        }
    }

    /// Prepend a context header: prefixed onto string content, or inserted
    /// as a leading text block ahead of block content.
    pub fn with_context(self, context: &ChannelContext) -> Self {
        let header = context.header();
        match self {
            Self::Text(text) => Self::Text(format!("{header}\n{text}")),
            Self::Blocks(blocks) => {
                let mut prefixed = Vec::with_capacity(blocks.len() + 1);
                prefixed.push(ContentBlock::Text {
                    text: format!("{header}\n"),
                });
                prefixed.extend(blocks);
                Self::Blocks(prefixed)
            }
        }
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// One typed content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

/// Base64 image payload as the agent expects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub data: String,
}

impl ImageSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: "base64".to_string(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

/// Frames written by the daemon to the host socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    User { message: UserMessage },
    Interrupt,
}

impl ClientFrame {
    pub fn user(content: MessageContent) -> Self {
        Self::User {
            message: UserMessage {
                role: "user".to_string(),
                content,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub role: String,
    pub content: MessageContent,
}

/// Where a message is being spoken from. Prepended to the content as a single
/// machine-readable header line so the agent knows where it is speaking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelContext {
    pub channel: String,
    pub adapter: String,
    pub user_name: Option<String>,
    pub chat_title: Option<String>,
    pub topic_name: Option<String>,
}

impl ChannelContext {
    pub fn new(channel: impl Into<String>, adapter: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            adapter: adapter.into(),
            user_name: None,
            chat_title: None,
            topic_name: None,
        }
    }

    /// Render the bracketed header line. Omitted fields are omitted entirely.
    pub fn header(&self) -> String {
        let mut parts = vec![
            format!("channel: {}", self.channel),
            format!("adapter: {}", self.adapter),
        ];
        if let Some(user) = &self.user_name {
            parts.push(format!("user: {user}"));
        }
        if let Some(chat) = &self.chat_title {
            parts.push(format!("chat: {chat}"));
        }
        if let Some(topic) = &self.topic_name {
            parts.push(format!("topic: {topic}"));
        }
        format!("[{}]", parts.join(", "))
    }
}

/// The envelope parsed out of every line the host forwards from the agent.
///
/// The agent's stream carries many event shapes; the core only needs the
/// terminal `result` fields. Everything else stays in `extra` so adapters
/// subscribing via `on_event` see the full payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,

    /// Final reply text of a real agent `result` line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Reply text of synthetic `result` lines emitted by the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AgentEvent {
    pub fn is_result(&self) -> bool {
        self.kind == RESULT_EVENT
    }

    pub fn is_stderr(&self) -> bool {
        self.kind == STDERR_EVENT
    }

    /// The reply text of a `result` line, whichever field carries it.
    pub fn final_text(&self) -> &str {
        if let Some(text) = &self.text {
            return text;
        }
        self.result.as_ref().and_then(|v| v.as_str()).unwrap_or("")
    }
}

/// Serialize a `_stderr` frame for mirroring an agent stderr line.
pub fn stderr_frame(text: &str) -> String {
    serde_json::json!({ "type": STDERR_EVENT, "text": text }).to_string()
}

/// Serialize the synthetic completion the host emits when the agent exits
/// with a dispatch in flight.
pub fn session_ended_frame(exit_code: i32) -> String {
    serde_json::json!({
        "type": RESULT_EVENT,
        "is_error": true,
        "text": format!(
            "[Session ended (exit code {exit_code}). Next message will start a fresh session with resume.]"
        ),
    })
    .to_string()
}
