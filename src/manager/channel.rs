//! Per-channel dispatch state.
//!
//! Each live channel owns one socket connection to its session host and a
//! FIFO of messages that arrived while a dispatch was in flight. The single
//! invariant this module exists to enforce: at most one dispatch in flight
//! per channel, with completions delivered in arrival order. The in-flight
//! handler is not a generic callback register: it is the private
//! continuation of the one send currently on the wire.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;

use crate::error::SendError;
use crate::protocol::{AgentEvent, ClientFrame, MessageContent};
use crate::sessions::SessionStore;

/// Outcome of one message's turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    pub text: String,
    pub duration_ms: u64,
    pub is_error: bool,
    /// True when this message was folded into a later message's turn; the
    /// real reply belongs to that turn, so transports skip emitting this one.
    pub coalesced: bool,
}

impl TurnResult {
    fn coalesced() -> Self {
        Self {
            text: String::new(),
            duration_ms: 0,
            is_error: false,
            coalesced: true,
        }
    }
}

/// Receiver for the intermediate events streamed during one send's turn.
/// Errors are logged and never interrupt the dispatch.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_event(&self, event: AgentEvent) -> anyhow::Result<()>;
}

pub type SharedSink = Arc<dyn EventSink>;

type Resolver = oneshot::Sender<Result<TurnResult, SendError>>;

pub(crate) struct QueuedMessage {
    pub content: MessageContent,
    pub on_event: Option<SharedSink>,
    pub resolver: Resolver,
}

struct InFlight {
    on_event: Option<SharedSink>,
    resolver: Resolver,
    started: Instant,
}

#[derive(Default)]
struct DispatchState {
    closed: bool,
    busy: bool,
    /// Only messages that arrived while busy.
    queue: VecDeque<QueuedMessage>,
    /// Non-empty iff busy.
    in_flight: Option<InFlight>,
}

/// What the drain step decided, computed under the state lock so no send can
/// slip between a completion and the next dispatch.
enum DrainAction {
    Idle,
    Dispatch {
        content: MessageContent,
        resolve_coalesced: Vec<Resolver>,
    },
}

/// One live channel: the socket write half plus dispatch state. The read
/// half lives in the reader task ([`run_reader`]).
pub(crate) struct ChannelConn {
    channel: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    state: std::sync::Mutex<DispatchState>,
}

impl ChannelConn {
    pub(crate) fn new(channel: &str, writer: OwnedWriteHalf) -> Self {
        Self {
            channel: channel.to_string(),
            writer: tokio::sync::Mutex::new(writer),
            state: std::sync::Mutex::new(DispatchState::default()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().map(|st| st.closed).unwrap_or(true)
    }

    /// Enqueue a message, dispatching immediately when the channel is idle.
    pub(crate) async fn submit(self: &Arc<Self>, message: QueuedMessage) {
        let QueuedMessage {
            content,
            on_event,
            resolver,
        } = message;

        let dispatch_now = {
            let Ok(mut st) = self.state.lock() else {
                let _ = resolver.send(Err(self.disconnected()));
                return;
            };
            if st.closed {
                let _ = resolver.send(Err(self.disconnected()));
                return;
            }
            if st.busy {
                st.queue.push_back(QueuedMessage {
                    content,
                    on_event,
                    resolver,
                });
                None
            } else {
                st.busy = true;
                st.in_flight = Some(InFlight {
                    on_event,
                    resolver,
                    started: Instant::now(),
                });
                Some(content)
            }
        };

        if let Some(content) = dispatch_now {
            self.write_user(content).await;
        }
    }

    /// Frame and write one user message to the host socket. A write failure
    /// tears the channel down; the caller's future fails via `disconnect`.
    async fn write_user(self: &Arc<Self>, content: MessageContent) {
        let frame = match serde_json::to_string(&ClientFrame::user(content)) {
            Ok(frame) => frame,
            Err(error) => {
                tracing::error!(channel = %self.channel, %error, "failed to encode user frame");
                self.disconnect();
                return;
            }
        };

        let write = {
            let mut writer = self.writer.lock().await;
            let result = async {
                writer.write_all(frame.as_bytes()).await?;
                writer.write_all(b"\n").await
            };
            result.await
        };
        if let Err(error) = write {
            tracing::warn!(channel = %self.channel, %error, "host socket write failed");
            self.disconnect();
        }
    }

    /// Terminal `result` line: persist the session identifier, resolve the
    /// in-flight send, then drain the queue.
    async fn complete_turn(self: &Arc<Self>, event: AgentEvent, sessions: &SessionStore) {
        // Persisted before the caller resolves, so a send racing in right
        // after can already spawn a replacement host with this identifier.
        if let Some(session_id) = &event.session_id {
            sessions.set(&self.channel, session_id);
        }

        let (finished, action) = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            let Some(finished) = st.in_flight.take() else {
                // A result with nothing in flight, e.g. the host's synthetic
                // completion after an idle agent exit. Nothing to resolve.
                return;
            };
            let action = drain(&mut st);
            (finished, action)
        };

        let result = TurnResult {
            text: event.final_text().to_string(),
            duration_ms: finished.started.elapsed().as_millis() as u64,
            is_error: event.is_error.unwrap_or(false),
            coalesced: false,
        };
        let _ = finished.resolver.send(Ok(result));

        if let DrainAction::Dispatch {
            content,
            resolve_coalesced,
        } = action
        {
            for resolver in resolve_coalesced {
                let _ = resolver.send(Ok(TurnResult::coalesced()));
            }
            self.write_user(content).await;
        }
    }

    /// Fail the in-flight send and everything queued, and mark the channel
    /// dead. Idempotent; the next send to this channel reconnects.
    pub(crate) fn disconnect(&self) {
        let (in_flight, queued) = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            if st.closed {
                return;
            }
            st.closed = true;
            st.busy = false;
            (st.in_flight.take(), std::mem::take(&mut st.queue))
        };

        if let Some(in_flight) = in_flight {
            let _ = in_flight.resolver.send(Err(self.disconnected()));
        }
        for message in queued {
            let _ = message.resolver.send(Err(self.disconnected()));
        }
    }

    fn disconnected(&self) -> SendError {
        SendError::ChannelDisconnected {
            channel: self.channel.clone(),
        }
    }

    fn current_sink(&self) -> Option<SharedSink> {
        self.state
            .lock()
            .ok()
            .and_then(|st| st.in_flight.as_ref().and_then(|f| f.on_event.clone()))
    }
}

/// Take the whole backlog and decide the next dispatch.
///
/// One entry dispatches directly. An all-text batch becomes a single combined
/// turn: every entry but the last resolves immediately as coalesced, and the
/// last entry's handler and resolver ride the combined dispatch. A mixed
/// batch dispatches its first entry alone and puts the remainder back at the
/// head in order.
fn drain(st: &mut DispatchState) -> DrainAction {
    let mut batch: Vec<QueuedMessage> = st.queue.drain(..).collect();
    if batch.is_empty() {
        st.busy = false;
        return DrainAction::Idle;
    }

    let all_text = batch.iter().all(|m| m.content.as_text().is_some());
    if all_text && batch.len() > 1 {
        let combined = batch
            .iter()
            .filter_map(|m| m.content.as_text())
            .collect::<Vec<_>>()
            .join("\n\n");
        let Some(last) = batch.pop() else {
            st.busy = false;
            return DrainAction::Idle;
        };
        st.busy = true;
        st.in_flight = Some(InFlight {
            on_event: last.on_event,
            resolver: last.resolver,
            started: Instant::now(),
        });
        return DrainAction::Dispatch {
            content: MessageContent::Text(combined),
            resolve_coalesced: batch.into_iter().map(|m| m.resolver).collect(),
        };
    }

    let mut rest = batch.split_off(1);
    let Some(first) = batch.pop() else {
        st.busy = false;
        return DrainAction::Idle;
    };
    st.queue.extend(rest.drain(..));
    st.busy = true;
    st.in_flight = Some(InFlight {
        on_event: first.on_event,
        resolver: first.resolver,
        started: Instant::now(),
    });
    DrainAction::Dispatch {
        content: first.content,
        resolve_coalesced: Vec::new(),
    }
}

/// Consume framed lines from the host until the socket closes, then tear the
/// channel down. Intermediate events go to the in-flight send's sink; the
/// `result` line completes the turn; `_stderr` lines are logged and never
/// surfaced as semantic events.
pub(crate) async fn run_reader(
    conn: Arc<ChannelConn>,
    read_half: OwnedReadHalf,
    sessions: SessionStore,
) {
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let event: AgentEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(channel = %conn.channel, %error, "discarding unparsable host line");
                continue;
            }
        };

        if event.is_stderr() {
            tracing::debug!(
                channel = %conn.channel,
                text = event.text.as_deref().unwrap_or(""),
                "agent stderr"
            );
            continue;
        }

        if event.is_result() {
            conn.complete_turn(event, &sessions).await;
            continue;
        }

        if let Some(sink) = conn.current_sink() {
            if let Err(error) = sink.on_event(event).await {
                tracing::warn!(channel = %conn.channel, %error, "event handler failed");
            }
        }
    }

    tracing::info!(channel = %conn.channel, "host socket closed");
    conn.disconnect();
}
