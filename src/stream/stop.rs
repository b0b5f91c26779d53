//! Stop control
//!
//! Stopping a chat forwards the intent to upstream as a detached
//! best-effort call and performs local cleanup immediately: cancel the
//! coordinator and its consumer, scrub the incomplete transcript tail, and
//! signal the room. Upstream failing or timing out never blocks cleanup.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::fanout::{base_event, fingerprint};
use crate::state::OrchestratorState;

/// Why the chat is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    UserStopped,
    TimeoutStopped,
}

impl StopReason {
    pub fn completion_type(&self) -> &'static str {
        match self {
            Self::UserStopped => "user_stopped",
            Self::TimeoutStopped => "timeout_stopped",
        }
    }
}

/// What the stop accomplished locally.
#[derive(Debug, Clone)]
pub struct StopOutcome {
    pub cleanup_completed: bool,
    pub consumer_cancelled: bool,
    pub messages_scrubbed: usize,
}

/// Stop a chat. Returns once local cleanup is done; the upstream call
/// continues in the background with its own long deadline.
pub async fn stop_chat(
    state: &Arc<OrchestratorState>,
    user_id: &str,
    session_id: &str,
    chat_id: Option<&str>,
    instance_id: Option<&str>,
    reason: StopReason,
) -> StopOutcome {
    // Forward the intent; the outcome does not gate local cleanup.
    {
        let state = state.clone();
        let token = state.registry.current_token().unwrap_or_default();
        let user = user_id.to_string();
        let session = session_id.to_string();
        let chat = chat_id.map(str::to_string);
        tokio::spawn(async move {
            if let Err(e) = state
                .upstream
                .stop(&token, &user, &session, chat.as_deref())
                .await
            {
                warn!(
                    target: "upstream",
                    session_id = %session,
                    error = %e,
                    "upstream stop failed; local cleanup already done"
                );
            }
        });
    }

    // Cancel the coordinator occupying the slot, remembering its identity
    // for room addressing when the caller did not name the chat.
    let active = state.cancel_stream(user_id, session_id);
    let chat_id = chat_id
        .map(str::to_string)
        .or_else(|| active.as_ref().map(|a| a.chat_id.clone()));
    let instance_id = instance_id
        .map(str::to_string)
        .or_else(|| active.as_ref().and_then(|a| a.instance_id.clone()));

    let consumer_cancelled =
        state
            .consumers
            .cancel_for(user_id, session_id, chat_id.as_deref());

    let messages_scrubbed = match chat_id.as_deref() {
        Some(chat) => state
            .transcripts
            .scrub_incomplete(user_id, session_id, chat),
        None => 0,
    };

    if let Some(chat) = chat_id.as_deref() {
        state.end_stream(user_id, session_id, chat);

        let room = fingerprint(user_id, session_id, chat, instance_id.as_deref());

        let mut complete = base_event("complete", chat, session_id, instance_id.as_deref());
        complete["completion_type"] = json!(reason.completion_type());
        complete["total_tokens"] = json!(0);
        state.rooms.emit(&room, &complete);

        // Room stays joinable so late bus deliveries can be routed and
        // discarded client-side by instance id.
        let mut hint = base_event("cleanup-generation", chat, session_id, instance_id.as_deref());
        hint["userId"] = json!(user_id);
        hint["sessionId"] = json!(session_id);
        hint["chatId"] = json!(chat);
        hint["instanceId"] = json!(instance_id);
        hint["reason"] = json!(reason.completion_type());
        state.rooms.emit(&room, &hint);
    }

    info!(
        target: "stream",
        user_id = %user_id,
        session_id = %session_id,
        chat_id = chat_id.as_deref().unwrap_or("-"),
        consumer_cancelled,
        messages_scrubbed,
        "chat stopped"
    );

    StopOutcome {
        cleanup_completed: true,
        consumer_cancelled,
        messages_scrubbed,
    }
}
