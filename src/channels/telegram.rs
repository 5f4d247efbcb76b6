//! Telegram long-poll adapter.
//!
//! Derives the channel key from the chat id (`tg-<chat_id>`), so everyone in
//! one chat talks to one agent session. Only allow-listed sender ids are
//! processed; the list is mandatory because the agent confers shell access.
//! The adapter also registers the `tg-` push handler for outbound messages.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use serde::Deserialize;
use tokio::sync::watch;

use crate::config::TelegramConfig;
use crate::manager::ChannelManager;
use crate::protocol::ChannelContext;
use crate::push::{PushHandler, PushMedia};

/// Telegram message size ceiling.
const MESSAGE_LIMIT: usize = 4096;

/// Long-poll timeout passed to `getUpdates`.
const POLL_TIMEOUT_SECS: u64 = 50;

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    #[serde(default)]
    from: Option<TgUser>,
    chat: TgChat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    #[serde(default)]
    title: Option<String>,
}

struct TelegramInner {
    http: reqwest::Client,
    config: TelegramConfig,
    manager: ChannelManager,
}

impl TelegramInner {
    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base,
            self.config.bot_token(),
            method
        )
    }

    fn is_allowed(&self, user: Option<&TgUser>) -> bool {
        sender_allowed(&self.config.allowed_users, user)
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> bool {
        for part in split_message(text, MESSAGE_LIMIT) {
            let response = self
                .http
                .post(self.api_url("sendMessage"))
                .json(&serde_json::json!({ "chat_id": chat_id, "text": part }))
                .send()
                .await;
            match response {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    tracing::warn!(chat_id, status = %response.status(), "sendMessage rejected");
                    return false;
                }
                Err(error) => {
                    tracing::warn!(chat_id, %error, "sendMessage failed");
                    return false;
                }
            }
        }
        true
    }

    async fn send_photo(&self, chat_id: i64, caption: &str, media: &PushMedia) -> bool {
        let bytes = match base64::engine::general_purpose::STANDARD.decode(&media.base64_data) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(chat_id, %error, "push media is not valid base64");
                return false;
            }
        };
        let part = match reqwest::multipart::Part::bytes(bytes)
            .file_name("attachment")
            .mime_str(&media.media_type)
        {
            Ok(part) => part,
            Err(error) => {
                tracing::warn!(chat_id, %error, "push media type rejected");
                return false;
            }
        };
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("photo", part);

        match self
            .http
            .post(self.api_url("sendPhoto"))
            .multipart(form)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(chat_id, status = %response.status(), "sendPhoto rejected");
                false
            }
            Err(error) => {
                tracing::warn!(chat_id, %error, "sendPhoto failed");
                false
            }
        }
    }
}

/// The inbound long-poll loop plus the outbound push handler.
pub struct TelegramChannel {
    inner: Arc<TelegramInner>,
}

impl TelegramChannel {
    pub fn new(config: TelegramConfig, manager: ChannelManager) -> Self {
        Self {
            inner: Arc::new(TelegramInner {
                http: reqwest::Client::new(),
                config,
                manager,
            }),
        }
    }

    /// Handler for the `tg-` prefix in the push registry.
    pub fn push_handler(&self) -> Arc<dyn PushHandler> {
        Arc::new(TelegramPush {
            inner: self.inner.clone(),
        })
    }

    /// Run the `getUpdates` loop until shutdown. Each accepted message is
    /// handled on its own task; the channel manager serializes per chat.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut offset: i64 = 0;
        tracing::info!("telegram adapter polling");

        loop {
            let updates = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                updates = self.get_updates(offset) => updates,
            };

            let updates = match updates {
                Ok(updates) => updates,
                Err(error) => {
                    tracing::warn!(%error, "getUpdates failed, backing off");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(message) = update.message else {
                    continue;
                };
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    handle_message(inner, message).await;
                });
            }
        }
        tracing::info!("telegram adapter stopped");
    }

    async fn get_updates(&self, offset: i64) -> anyhow::Result<Vec<Update>> {
        let response: UpdatesResponse = self
            .inner
            .http
            .get(self.inner.api_url("getUpdates"))
            .query(&[("timeout", POLL_TIMEOUT_SECS as i64), ("offset", offset)])
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .send()
            .await?
            .json()
            .await?;
        if !response.ok {
            anyhow::bail!("getUpdates returned ok=false");
        }
        Ok(response.result)
    }
}

async fn handle_message(inner: Arc<TelegramInner>, message: TgMessage) {
    let Some(text) = message.text.clone() else {
        return;
    };
    if !inner.is_allowed(message.from.as_ref()) {
        tracing::warn!(
            chat_id = message.chat.id,
            from = ?message.from.as_ref().map(|u| u.id),
            "ignoring message from non-allow-listed sender"
        );
        return;
    }

    let channel = channel_key(message.chat.id);
    let context = ChannelContext {
        channel: channel.clone(),
        adapter: "telegram".to_string(),
        user_name: message
            .from
            .as_ref()
            .and_then(|u| u.username.clone().or_else(|| u.first_name.clone())),
        chat_title: message.chat.title.clone(),
        topic_name: None,
    };

    match inner
        .manager
        .send(&channel, text.as_str(), Some(&context), None)
        .await
    {
        // Coalesced: the reply belongs to a later message's combined turn.
        Ok(result) if result.coalesced => {}
        // Session-ended noise, not a user-intelligible answer. The session
        // resumes on the next message by itself.
        Ok(result) if result.is_error => {
            tracing::warn!(channel, "suppressing error completion");
        }
        Ok(result) if result.text.is_empty() => {}
        Ok(result) => {
            inner.send_text(message.chat.id, &result.text).await;
        }
        Err(error) => {
            tracing::error!(channel, %error, "dispatch failed");
            inner
                .send_text(message.chat.id, "The assistant is unreachable right now.")
                .await;
        }
    }
}

struct TelegramPush {
    inner: Arc<TelegramInner>,
}

#[async_trait::async_trait]
impl PushHandler for TelegramPush {
    async fn deliver(&self, channel: &str, text: &str, media: Option<&PushMedia>) -> bool {
        let Some(chat_id) = chat_id_from_channel(channel) else {
            tracing::warn!(channel, "push channel does not carry a chat id");
            return false;
        };
        match media {
            Some(media) => self.inner.send_photo(chat_id, text, media).await,
            None => self.inner.send_text(chat_id, text).await,
        }
    }
}

/// No sender, no service: messages without an allow-listed `from` id are
/// dropped. There is deliberately no default-allow.
fn sender_allowed(allowed: &[i64], user: Option<&TgUser>) -> bool {
    user.is_some_and(|user| allowed.contains(&user.id))
}

fn channel_key(chat_id: i64) -> String {
    format!("tg-{chat_id}")
}

fn chat_id_from_channel(channel: &str) -> Option<i64> {
    channel.strip_prefix("tg-")?.parse().ok()
}

/// Split on the last newline before the limit when there is one, otherwise
/// at a char boundary.
fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = text;
    while rest.len() > limit {
        let mut cut = limit;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let window = &rest[..cut];
        let split_at = match window.rfind('\n') {
            Some(at) if at > 0 => at,
            _ => cut,
        };
        parts.push(rest[..split_at].to_string());
        rest = rest[split_at..].trim_start_matches('\n');
    }
    if !rest.is_empty() || parts.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}
