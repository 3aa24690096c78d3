//! HTTP/WebSocket Handlers
//!
//! The gateway is just another channel: requests become inbound messages on
//! the `http` channel and replies are picked off the outbound router.

use std::time::Duration;

use axum::{
    Json,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use agent_core::{AgentError, InboundMessage, MetricsSummary, ModelInfo, SubagentTask};

use crate::channel::next_for;
use crate::state::AppState;

pub const HTTP_CHANNEL: &str = "http";

const CHAT_REPLY_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub provider: String,
    pub provider_connected: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub chat_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    pub chat_id: Option<String>,
}

/// Optional JSON form of a WebSocket text frame
#[derive(Debug, Deserialize)]
struct StreamFrame {
    message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Message must not be empty")]
    EmptyMessage,

    #[error("No reply within {0} seconds")]
    Timeout(u64),

    #[error("Agent is not running")]
    Unavailable,

    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::EmptyMessage => (StatusCode::BAD_REQUEST, "EMPTY_MESSAGE"),
            ApiError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            ApiError::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            ApiError::Agent(AgentError::ProviderUnavailable(_)) => (StatusCode::SERVICE_UNAVAILABLE, "PROVIDER_UNAVAILABLE"),
            ApiError::Agent(_) => (StatusCode::INTERNAL_SERVER_ERROR, "AGENT_ERROR"),
        };
        let error = match &self {
            ApiError::Agent(e) => e.user_message(),
            other => other.to_string(),
        };
        (status, Json(ErrorResponse { error, code })).into_response()
    }
}

fn new_chat_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let provider_connected = state.provider.health_check().await.unwrap_or(false);

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        provider: state.provider.name().to_string(),
        provider_connected,
    })
}

/// List the provider's models
pub async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<ModelInfo>>, ApiError> {
    Ok(Json(state.provider.list_models().await?))
}

/// Send one message and wait for the reply to that chat
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let message = payload.message.trim();
    if message.is_empty() {
        return Err(ApiError::EmptyMessage);
    }
    let chat_id = payload.chat_id.unwrap_or_else(new_chat_id);
    let sender_id = payload.sender_id.unwrap_or_else(|| chat_id.clone());

    // Subscribe first so the reply cannot slip past
    let mut rx = state.outbound.subscribe();
    state
        .bus
        .publish_inbound(InboundMessage::new(HTTP_CHANNEL, sender_id, &chat_id, message))
        .await?;

    let reply = tokio::time::timeout(CHAT_REPLY_TIMEOUT, next_for(&mut rx, HTTP_CHANNEL, &chat_id))
        .await
        .map_err(|_| ApiError::Timeout(CHAT_REPLY_TIMEOUT.as_secs()))?
        .ok_or(ApiError::Unavailable)?;

    Ok(Json(ChatResponse {
        message: reply.content,
        chat_id,
    }))
}

/// WebSocket chat: text frames in, replies for the chat out
pub async fn chat_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Response {
    let chat_id = params.chat_id.unwrap_or_else(new_chat_id);
    ws.on_upgrade(move |socket| handle_stream(socket, state, chat_id))
}

async fn handle_stream(socket: WebSocket, state: AppState, chat_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.outbound.subscribe();

    let forward_chat = chat_id.clone();
    let mut forward = tokio::spawn(async move {
        while let Some(out) = next_for(&mut rx, HTTP_CHANNEL, &forward_chat).await {
            let frame = serde_json::json!({
                "type": "message",
                "chat_id": out.chat_id,
                "content": out.content,
            });
            if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            _ = &mut forward => break,
            msg = receiver.next() => msg,
        };
        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            Some(Ok(_)) => continue,
        };

        let content = match serde_json::from_str::<StreamFrame>(text.as_str()) {
            Ok(frame) => frame.message,
            Err(_) => text.as_str().to_string(),
        };
        if content.trim().is_empty() {
            continue;
        }

        let inbound = InboundMessage::new(HTTP_CHANNEL, chat_id.clone(), chat_id.clone(), content);
        if let Err(e) = state.bus.publish_inbound(inbound).await {
            tracing::error!(chat_id = %chat_id, error = %e, "Could not publish WebSocket message");
            break;
        }
    }

    forward.abort();
    tracing::debug!(chat_id = %chat_id, "WebSocket closed");
}

/// Tracked subagent tasks
pub async fn list_subagents(State(state): State<AppState>) -> Json<Vec<SubagentTask>> {
    Json(state.agent.subagents().tasks())
}

pub async fn metrics(State(state): State<AppState>) -> Json<MetricsSummary> {
    Json(state.agent.metrics().summary())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_defaults() {
        let request: ChatRequest = serde_json::from_str(r#"{"message": "hi"}"#).unwrap();
        assert_eq!(request.message, "hi");
        assert!(request.chat_id.is_none());
        assert!(request.sender_id.is_none());
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(ApiError::EmptyMessage.into_response().status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Timeout(120).into_response().status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ApiError::Agent(AgentError::ProviderUnavailable("down".into())).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
