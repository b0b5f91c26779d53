//! HTTP endpoint handlers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

use crate::bus::payload::{self, BusMessage};
use crate::state::OrchestratorState;
use crate::stream::{self, ChatError, ChatParams, StopReason};
use crate::upstream::ChatFlags;

/// Error envelope returned by every endpoint.
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION",
            message: message.into(),
        }
    }

    fn unauthenticated() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHENTICATED",
            message: "no user is bound; log in first".to_string(),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        let status = match &err {
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::LimitReached { .. } => StatusCode::TOO_MANY_REQUESTS,
            ChatError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "ok": false,
            "error_code": self.code,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatSendRequest {
    pub user_id: String,
    pub session_id: String,
    pub chat_id: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub llm_model_id: Option<String>,
    pub prompt: String,
    #[serde(flatten)]
    pub flags: ChatFlags,
    #[serde(default)]
    pub temp_file_paths: Vec<String>,
}

/// `POST /chat` — chunked response, one JSON event per line.
pub async fn chat_handler(
    State(state): State<Arc<OrchestratorState>>,
    Json(request): Json<ChatSendRequest>,
) -> Result<Response, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::validation("prompt must not be empty"));
    }
    let params = ChatParams {
        user_id: request.user_id,
        session_id: request.session_id,
        chat_id: request.chat_id,
        instance_id: request.instance_id,
        model_id: request.llm_model_id.unwrap_or_default(),
        prompt: request.prompt,
        flags: request.flags,
        temp_file_paths: request.temp_file_paths,
    };

    let rx = stream::start_chat(state, params).await?;
    let body = Body::from_stream(UnboundedReceiverStream::new(rx).map(|event| {
        let mut line = event.to_string();
        line.push('\n');
        Ok::<_, Infallible>(Bytes::from(line))
    }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(body)
        .map_err(|e| ApiError::validation(e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct UserRequest {
    pub user_id: String,
}

/// `POST /sessionName` — the "chat history" trigger. Serves the catalog
/// from memory once it holds upstream-sourced entries; otherwise runs a
/// fresh re-sync.
pub async fn session_name_handler(
    State(state): State<Arc<OrchestratorState>>,
    Json(request): Json<UserRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.user_id.is_empty() {
        return Err(ApiError::validation("user_id is required"));
    }
    let sessions = if state.catalog.has_upstream_entries(&request.user_id) {
        state.catalog.list(&request.user_id)
    } else {
        stream::sync_session_index(&state, &request.user_id).await?
    };
    Ok(Json(json!({ "ok": true, "sessions": sessions })))
}

#[derive(Debug, Deserialize)]
pub struct SessionHistoryRequest {
    pub user_id: String,
    pub session_id: String,
}

/// `POST /sessionhistory` — memory first, then upstream plus the bus.
pub async fn session_history_handler(
    State(state): State<Arc<OrchestratorState>>,
    Json(request): Json<SessionHistoryRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.user_id.is_empty() || request.session_id.is_empty() {
        return Err(ApiError::validation("user_id and session_id are required"));
    }

    if state
        .transcripts
        .has_transcript(&request.user_id, &request.session_id)
    {
        let messages = state
            .transcripts
            .history(&request.user_id, &request.session_id);
        return Ok(Json(json!({ "ok": true, "messages": messages })));
    }

    let messages = fetch_history_from_upstream(&state, &request.user_id, &request.session_id)
        .await
        .unwrap_or_default();
    Ok(Json(json!({ "ok": true, "messages": messages })))
}

/// Subscribe to the history queue, ask upstream to publish, and wait for
/// the payload within the history deadline.
async fn fetch_history_from_upstream(
    state: &Arc<OrchestratorState>,
    user_id: &str,
    session_id: &str,
) -> Option<Vec<Value>> {
    let token = state.registry.current_token()?;
    let (tx, mut rx) = mpsc::channel(16);
    let consumer = state
        .consumers
        .acquire(&state.config.queues.session_history, "session-history", tx)
        .await
        .ok()?;

    let direct = match state
        .upstream
        .request_session_history(&token, user_id, session_id)
        .await
    {
        Ok(body) => body,
        Err(e) => {
            warn!(target: "upstream", error = %e, "session history request failed");
            state.consumers.cancel(consumer.id);
            return None;
        }
    };

    // Some upstream builds echo the transcript in the HTTP body directly.
    if let Some(BusMessage::SessionHistory { messages, .. }) = direct.as_ref().map(payload::decode)
    {
        state.consumers.cancel(consumer.id);
        return Some(messages);
    }

    let wait = Duration::from_millis(state.config.timeouts.upstream_history_ms);
    let result = tokio::time::timeout(wait, async {
        while let Some(value) = rx.recv().await {
            if let BusMessage::SessionHistory {
                session_id: payload_session,
                messages,
            } = payload::decode(&value)
            {
                if payload_session.as_deref().map_or(true, |s| s == session_id) {
                    return Some(messages);
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    state.consumers.cancel(consumer.id);
    result
}

/// `POST /chatsession` — mint a session id locally.
pub async fn chat_session_handler(
    State(state): State<Arc<OrchestratorState>>,
    Json(request): Json<UserRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.user_id.is_empty() {
        return Err(ApiError::validation("user_id is required"));
    }
    if state.registry.current_user().is_none() {
        return Err(ApiError::unauthenticated());
    }

    let (entry, outcome) = state.catalog.mint_session(&request.user_id);

    let mut window = json!({ "warning": outcome.eviction_warning });
    if let Some(evicted) = outcome.evicted {
        state
            .transcripts
            .drop_session(&request.user_id, &evicted.id);
        window["deleted_session"] = json!({
            "session_id": evicted.id,
            "title": evicted.title,
        });
    }

    Ok(Json(json!({
        "ok": true,
        "session_id": entry.id,
        "title": entry.title,
        "window_management": window,
    })))
}

/// `DELETE /deletesession/{id}` — local removal plus best-effort upstream
/// delete.
pub async fn delete_session_handler(
    State(state): State<Arc<OrchestratorState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let Some(user) = state.registry.current_user() else {
        return Err(ApiError::unauthenticated());
    };

    let removed = state.catalog.remove(&user.user_id, &session_id);
    state.transcripts.drop_session(&user.user_id, &session_id);
    state
        .consumers
        .cancel_for(&user.user_id, &session_id, None);

    let upstream_deleted = match state
        .upstream
        .delete_session(&user.token, &user.user_id, &session_id)
        .await
    {
        Ok(()) => true,
        Err(e) => {
            warn!(target: "upstream", session_id = %session_id, error = %e, "upstream delete failed");
            false
        }
    };

    Ok(Json(json!({
        "ok": true,
        "removed": removed,
        "upstream_deleted": upstream_deleted,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
}

/// `POST /stop` — succeeds whenever local cleanup completed, whatever
/// upstream does.
pub async fn stop_handler(
    State(state): State<Arc<OrchestratorState>>,
    Json(request): Json<StopRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.user_id.is_empty() || request.session_id.is_empty() {
        return Err(ApiError::validation("user_id and session_id are required"));
    }
    let outcome = stream::stop_chat(
        &state,
        &request.user_id,
        &request.session_id,
        request.chat_id.as_deref(),
        request.instance_id.as_deref(),
        StopReason::UserStopped,
    )
    .await;

    Ok(Json(json!({
        "ok": true,
        "cleanup_completed": outcome.cleanup_completed,
        "consumer_cancelled": outcome.consumer_cancelled,
        "messages_scrubbed": outcome.messages_scrubbed,
    })))
}

#[derive(Debug, Deserialize)]
pub struct NextChatIdRequest {
    pub user_id: String,
    pub session_id: String,
}

/// `POST /nextchatid`
pub async fn next_chat_id_handler(
    State(state): State<Arc<OrchestratorState>>,
    Json(request): Json<NextChatIdRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.user_id.is_empty() || request.session_id.is_empty() {
        return Err(ApiError::validation("user_id and session_id are required"));
    }
    let next = state
        .catalog
        .next_chat_id(&request.user_id, &request.session_id);
    Ok(Json(json!({ "ok": true, "next_chat_id": next.to_string() })))
}

#[derive(Debug, Deserialize)]
pub struct SessionCountQuery {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// `GET /sessioncount`
pub async fn session_count_handler(
    State(state): State<Arc<OrchestratorState>>,
    Query(query): Query<SessionCountQuery>,
) -> Result<Json<Value>, ApiError> {
    let user_id = match query.user_id {
        Some(id) if !id.is_empty() => id,
        _ => state
            .registry
            .current_user_id()
            .ok_or_else(ApiError::unauthenticated)?,
    };
    let count = state.catalog.count(&user_id);
    Ok(Json(json!({ "ok": true, "user_id": user_id, "count": count })))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub user_id: String,
    pub token: String,
    #[serde(default)]
    pub last_upstream_session_id: u64,
    #[serde(default)]
    pub personalized_files: Vec<String>,
}

/// `POST /login` — bind the current user and seed the id cursor. The
/// token is trusted as-is; upstream minted it.
pub async fn login_handler(
    State(state): State<Arc<OrchestratorState>>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.user_id.is_empty() || request.token.is_empty() {
        return Err(ApiError::validation("user_id and token are required"));
    }
    state.registry.bind_user(
        &request.user_id,
        &request.token,
        request.last_upstream_session_id,
        request.personalized_files,
    );
    state
        .catalog
        .seed_cursor(&request.user_id, request.last_upstream_session_id);
    Ok(Json(json!({ "ok": true, "user_id": request.user_id })))
}

/// `POST /logout` — the authoritative total flush.
pub async fn logout_handler(
    State(state): State<Arc<OrchestratorState>>,
) -> Json<Value> {
    state.registry.flush_all();
    Json(json!({ "ok": true }))
}

/// `GET /health`
pub async fn health_handler(State(state): State<Arc<OrchestratorState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "uptime_secs": state.uptime_secs(),
        "bus_connected": state.bus.is_connected(),
        "active_streams": state.active_stream_count(),
        "rooms": state.rooms.room_count(),
    }))
}

/// `GET /models`
pub async fn models_handler(State(state): State<Arc<OrchestratorState>>) -> Json<Value> {
    let models: Vec<Value> = state
        .models
        .list()
        .into_iter()
        .map(|p| {
            json!({
                "id": p.id,
                "name": p.name,
                "supports_thinking": p.supports_thinking,
            })
        })
        .collect();
    Json(json!({ "models": models }))
}
