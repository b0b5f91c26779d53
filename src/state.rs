//! Shared orchestrator state
//!
//! One instance per process, shared by the HTTP handlers, the push
//! channel, and the streaming coordinators. Also owns the active-stream
//! table: at most one live coordinator per `(user, session)` pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bus::{Bus, ConsumerManager};
use crate::catalog::SessionCatalog;
use crate::config::OrchestratorConfig;
use crate::fanout::RoomRegistry;
use crate::models::ModelTable;
use crate::now_ms;
use crate::registry::Registry;
use crate::transcript::TranscriptStore;
use crate::upstream::{UpstreamClient, UpstreamError};

/// Bookkeeping for one live chat stream.
#[derive(Debug, Clone)]
pub struct ActiveStream {
    pub chat_id: String,
    pub instance_id: Option<String>,
    pub started_at_ms: i64,
    pub cancel: CancellationToken,
}

type SlotKey = (String, String);

pub struct OrchestratorState {
    pub config: OrchestratorConfig,
    pub registry: Registry,
    pub models: ModelTable,
    pub catalog: SessionCatalog,
    pub transcripts: TranscriptStore,
    pub bus: Arc<dyn Bus>,
    pub consumers: ConsumerManager,
    pub upstream: UpstreamClient,
    pub rooms: RoomRegistry,
    active: Mutex<HashMap<SlotKey, ActiveStream>>,
    start_time: Instant,
}

impl OrchestratorState {
    pub fn new(config: OrchestratorConfig, bus: Arc<dyn Bus>) -> Result<Self, UpstreamError> {
        let upstream = UpstreamClient::new(config.upstream_url.clone(), config.timeouts.clone())?;
        Ok(Self {
            registry: Registry::new(),
            models: ModelTable::new(),
            catalog: SessionCatalog::new(config.session_cap),
            transcripts: TranscriptStore::new(),
            consumers: ConsumerManager::new(bus.clone()),
            bus,
            upstream,
            rooms: RoomRegistry::new(),
            active: Mutex::new(HashMap::new()),
            start_time: Instant::now(),
            config,
        })
    }

    /// Register the logout flush hooks. Called once after construction.
    pub fn wire_flush(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.registry.on_flush(move || {
            let Some(state) = weak.upgrade() else {
                return;
            };
            state.consumers.force_cleanup_all();
            let mut active = state.active.lock();
            for stream in active.values() {
                stream.cancel.cancel();
            }
            active.clear();
            drop(active);
            state.catalog.flush_all();
            state.transcripts.flush_all();
            state.models.clear_cache();
            state.rooms.clear();
            info!(target: "server", "logout flush completed");
        });
    }

    /// Claim the streaming slot for `(user, session)`, cancelling any prior
    /// occupant. Returns the new stream's cancellation token.
    pub fn begin_stream(
        &self,
        user_id: &str,
        session_id: &str,
        chat_id: &str,
        instance_id: Option<String>,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        let mut active = self.active.lock();
        if let Some(prior) = active.insert(
            (user_id.to_string(), session_id.to_string()),
            ActiveStream {
                chat_id: chat_id.to_string(),
                instance_id,
                started_at_ms: now_ms(),
                cancel: cancel.clone(),
            },
        ) {
            prior.cancel.cancel();
        }
        cancel
    }

    /// Release the slot, but only if this chat still owns it.
    pub fn end_stream(&self, user_id: &str, session_id: &str, chat_id: &str) {
        let mut active = self.active.lock();
        let key = (user_id.to_string(), session_id.to_string());
        if active
            .get(&key)
            .is_some_and(|s| s.chat_id == chat_id)
        {
            active.remove(&key);
        }
    }

    /// Cancel the live stream in a slot, leaving the entry for the
    /// coordinator to clean up. Returns the cancelled entry.
    pub fn cancel_stream(&self, user_id: &str, session_id: &str) -> Option<ActiveStream> {
        let active = self.active.lock();
        let entry = active
            .get(&(user_id.to_string(), session_id.to_string()))
            .cloned();
        if let Some(ref stream) = entry {
            stream.cancel.cancel();
        }
        entry
    }

    pub fn active_stream(&self, user_id: &str, session_id: &str) -> Option<ActiveStream> {
        self.active
            .lock()
            .get(&(user_id.to_string(), session_id.to_string()))
            .cloned()
    }

    pub fn active_stream_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;

    fn make_state() -> Arc<OrchestratorState> {
        let bus = Arc::new(InProcessBus::new());
        let state = Arc::new(
            OrchestratorState::new(OrchestratorConfig::default(), bus).expect("state builds"),
        );
        state.wire_flush();
        state
    }

    #[test]
    fn test_begin_stream_cancels_prior_occupant() {
        let state = make_state();
        let first = state.begin_stream("u1", "19", "1", None);
        assert!(!first.is_cancelled());

        let second = state.begin_stream("u1", "19", "2", None);
        assert!(first.is_cancelled(), "prior stream cancelled");
        assert!(!second.is_cancelled());
        assert_eq!(state.active_stream_count(), 1);
    }

    #[test]
    fn test_end_stream_respects_ownership() {
        let state = make_state();
        state.begin_stream("u1", "19", "1", None);
        state.begin_stream("u1", "19", "2", None);

        // Chat 1 lost the slot; its cleanup must not evict chat 2.
        state.end_stream("u1", "19", "1");
        assert!(state.active_stream("u1", "19").is_some());

        state.end_stream("u1", "19", "2");
        assert!(state.active_stream("u1", "19").is_none());
    }

    #[test]
    fn test_flush_clears_everything() {
        let state = make_state();
        state.registry.bind_user("u1", "tok", 0, vec![]);
        state.catalog.upsert_for_chat("u1", "1", "1");
        state
            .transcripts
            .append_user_prompt("u1", "1", "1", "hi", None);
        let cancel = state.begin_stream("u1", "1", "1", None);

        state.registry.flush_all();

        assert!(state.registry.current_user().is_none());
        assert_eq!(state.catalog.count("u1"), 0);
        assert!(state.transcripts.is_empty());
        assert!(cancel.is_cancelled());
        assert_eq!(state.active_stream_count(), 0);
    }
}
