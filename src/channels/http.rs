//! Synchronous HTTP adapter.
//!
//! One request, one agent turn: `POST /v1/message` blocks until the turn
//! completes, which may be minutes; there is deliberately no timeout. `POST
//! /v1/push` is the agent-bypassing outbound path for scheduled jobs.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    routing::{get, post},
};
use secrecy::ExposeSecret as _;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::HttpConfig;
use crate::error::SendError;
use crate::manager::ChannelManager;
use crate::protocol::ChannelContext;
use crate::push::{PushMedia, PushRegistry};

struct HttpState {
    manager: ChannelManager,
    push: PushRegistry,
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRequest {
    /// Optional conversation id; requests without one share the `http`
    /// channel, which is a feature, not a collision.
    channel: Option<String>,
    message: String,
    user_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    text: String,
    duration_ms: u64,
    coalesced: bool,
}

#[derive(Debug, Deserialize)]
struct PushRequest {
    channel: String,
    text: String,
    media: Option<PushMediaBody>,
}

#[derive(Debug, Deserialize)]
struct PushMediaBody {
    media_type: String,
    base64_data: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Start the HTTP adapter. Returns the bound address and the serve task,
/// which finishes once `shutdown` flips.
pub async fn serve(
    config: &HttpConfig,
    manager: ChannelManager,
    push: PushRegistry,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    let state = Arc::new(HttpState {
        manager,
        push,
        auth_token: config
            .auth_token
            .as_ref()
            .map(|token| token.expose_secret().to_string()),
    });

    let app = Router::new()
        .route("/healthz", get(health_handler))
        .route("/v1/message", post(message_handler))
        .route("/v1/push", post(push_handler))
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        });
        if let Err(error) = serve.await {
            tracing::error!(%error, "http adapter failed");
        }
    });

    Ok((bound, handle))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn message_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(request): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, (StatusCode, Json<ErrorBody>)> {
    require_auth(&headers, state.auth_token.as_deref())?;

    let channel = match &request.channel {
        Some(id) => format!("http-{id}"),
        None => "http".to_string(),
    };
    let context = ChannelContext {
        channel: channel.clone(),
        adapter: "http".to_string(),
        user_name: request.user_name.clone(),
        chat_title: None,
        topic_name: None,
    };

    match state
        .manager
        .send(&channel, request.message.as_str(), Some(&context), None)
        .await
    {
        // An `is_error` completion is dispatch bookkeeping, not an answer.
        Ok(result) if result.is_error => Err(error_response(
            StatusCode::BAD_GATEWAY,
            "agent session ended; retry to resume",
        )),
        Ok(result) => Ok(Json(MessageResponse {
            text: result.text,
            duration_ms: result.duration_ms,
            coalesced: result.coalesced,
        })),
        Err(error @ SendError::HostUnreachable { .. }) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &error.to_string(),
        )),
        Err(error @ SendError::ChannelDisconnected { .. }) => Err(error_response(
            StatusCode::BAD_GATEWAY,
            &error.to_string(),
        )),
    }
}

async fn push_handler(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    Json(request): Json<PushRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
    require_auth(&headers, state.auth_token.as_deref())?;

    let media = request.media.map(|body| PushMedia {
        media_type: body.media_type,
        base64_data: body.base64_data,
    });
    let delivered = state
        .push
        .send(&request.channel, &request.text, media.as_ref())
        .await;

    if delivered {
        Ok(Json(serde_json::json!({ "delivered": true })))
    } else {
        Err(error_response(
            StatusCode::NOT_FOUND,
            "no transport registered for this channel",
        ))
    }
}

fn require_auth(
    headers: &HeaderMap,
    expected: Option<&str>,
) -> Result<(), (StatusCode, Json<ErrorBody>)> {
    if bearer_authorized(headers, expected) {
        Ok(())
    } else {
        Err(error_response(StatusCode::UNAUTHORIZED, "invalid token"))
    }
}

fn bearer_authorized(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

fn error_response(status: StatusCode, message: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
}
