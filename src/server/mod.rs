//! HTTP and push-channel server
//!
//! Routes:
//! - `POST /chat` — start a chat; chunked line-delimited JSON response
//! - `POST /sessionName` — FIFO re-sync; merged latest session list
//! - `POST /sessionhistory` — transcript for a session (memory first)
//! - `POST /chatsession` — mint a session id; reports window eviction
//! - `DELETE /deletesession/{id}` — delete locally and upstream
//! - `POST /stop` — stop a chat; always succeeds once local cleanup ran
//! - `POST /nextchatid`, `GET /sessioncount` — counter accessors
//! - `POST /login`, `POST /logout` — user binding and total flush
//! - `GET /health`, `GET /models` — liveness and the model table
//! - `GET /ws` — push channel (room join/leave + event delivery)

pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tracing::info;

use crate::state::OrchestratorState;

/// Build the router over shared state.
pub fn create_router(state: Arc<OrchestratorState>) -> Router {
    Router::new()
        .route("/chat", post(http::chat_handler))
        .route("/sessionName", post(http::session_name_handler))
        .route("/sessionhistory", post(http::session_history_handler))
        .route("/chatsession", post(http::chat_session_handler))
        .route("/deletesession/:id", delete(http::delete_session_handler))
        .route("/stop", post(http::stop_handler))
        .route("/nextchatid", post(http::next_chat_id_handler))
        .route("/sessioncount", get(http::session_count_handler))
        .route("/login", post(http::login_handler))
        .route("/logout", post(http::logout_handler))
        .route("/health", get(http::health_handler))
        .route("/models", get(http::models_handler))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Bind and serve until ctrl-c. Live consumers are cancelled on the way
/// out so the bus connection closes cleanly.
pub async fn serve(state: Arc<OrchestratorState>) -> std::io::Result<()> {
    let bind = state.config.bind;
    let router = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(target: "server", addr = %bind, "orchestrator listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "server", "shutdown signal received");
            state.consumers.force_cleanup_all();
        })
        .await
}
