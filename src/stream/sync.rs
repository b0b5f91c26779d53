//! Session-index reconciliation
//!
//! Asks upstream to publish its authoritative latest-N session list and
//! merges it into the catalog. The consumer starts before the HTTP
//! request so the published payload cannot be missed. The merged list is
//! returned immediately; the catalog itself is updated in a detached task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::payload::{self, BusMessage};
use crate::catalog::{IndexedSession, SessionEntry};
use crate::state::OrchestratorState;
use crate::stream::ChatError;

/// Run one index re-sync for a user and return the merged latest list.
///
/// When upstream publishes nothing within the metadata deadline, the local
/// catalog snapshot is returned unchanged.
pub async fn sync_session_index(
    state: &Arc<OrchestratorState>,
    user_id: &str,
) -> Result<Vec<SessionEntry>, ChatError> {
    let token = state
        .registry
        .current_token()
        .ok_or(ChatError::Unauthenticated)?;

    let (tx, mut rx) = mpsc::channel(16);
    let consumer = state
        .consumers
        .acquire(&state.config.queues.session_index, "session-index", tx)
        .await?;

    if let Err(e) = state.upstream.request_session_index(&token, user_id).await {
        state.consumers.cancel(consumer.id);
        return Err(ChatError::Upstream(e.to_string()));
    }

    let wait = Duration::from_millis(state.config.timeouts.upstream_metadata_ms);
    let sessions = tokio::time::timeout(wait, async {
        while let Some(value) = rx.recv().await {
            if let BusMessage::SessionIndex {
                user_id: payload_user,
                sessions,
            } = payload::decode(&value)
            {
                // Index payloads for other users share the queue.
                if payload_user.as_deref().map_or(true, |u| u == user_id) {
                    return Some(sessions);
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    state.consumers.cancel(consumer.id);

    match sessions {
        Some(sessions) => Ok(apply_index(state, user_id, sessions)),
        None => {
            debug!(target: "catalog", user_id = %user_id, "no index payload before deadline");
            Ok(state.catalog.list(user_id))
        }
    }
}

/// Compute the merged list for the caller, then reconcile the catalog in a
/// detached task.
fn apply_index(
    state: &Arc<OrchestratorState>,
    user_id: &str,
    sessions: Vec<IndexedSession>,
) -> Vec<SessionEntry> {
    let merged = state.catalog.merge_with_index(user_id, &sessions);

    let state = state.clone();
    let user_id = user_id.to_string();
    tokio::spawn(async move {
        let evicted = state.catalog.apply_upstream_index(&user_id, &sessions);
        for entry in evicted {
            state.transcripts.drop_session(&user_id, &entry.id);
        }
    });

    merged
}
