//! Consumer lifecycle manager
//!
//! Guarantees at most one live bus subscription per streaming slot, where a
//! slot is a `(user_id, session_id)` pair. Acquiring a slot cancels any
//! prior occupant before subscribing. Every consumer carries a tag that
//! embeds its identifiers so targeted cancellation can match it later.
//!
//! Cancellation never touches the underlying bus connection; the channel is
//! shared and must stay usable for publishing elsewhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Bus, BusError};

/// Identifiers embedded in a consumer tag.
#[derive(Debug, Clone)]
pub struct ConsumerTag {
    pub conn: String,
    pub user_id: String,
    pub session_id: String,
    pub chat_id: String,
    pub epoch: u64,
}

impl ConsumerTag {
    pub fn render(&self) -> String {
        format!(
            "socket_{}_{}_{}_{}",
            self.conn, self.session_id, self.chat_id, self.epoch
        )
    }
}

/// Handle for a live consumer.
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    pub id: u64,
    pub tag: String,
}

struct ConsumerEntry {
    tag: String,
    user_id: String,
    session_id: String,
    chat_id: Option<String>,
    /// Whether this consumer occupies a streaming slot.
    streaming: bool,
    cancel: CancellationToken,
}

/// Manages every live bus consumer in the process.
pub struct ConsumerManager {
    bus: Arc<dyn Bus>,
    entries: Arc<Mutex<HashMap<u64, ConsumerEntry>>>,
    next_id: AtomicU64,
    epoch: AtomicU64,
}

impl ConsumerManager {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            epoch: AtomicU64::new(1),
        }
    }

    /// Build a tag for a streaming consumer.
    pub fn make_tag(&self, conn: &str, user_id: &str, session_id: &str, chat_id: &str) -> ConsumerTag {
        ConsumerTag {
            conn: conn.to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            chat_id: chat_id.to_string(),
            epoch: self.epoch.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Subscribe to a queue for a streaming chat, taking ownership of the
    /// `(user, session)` slot. Any prior occupant is cancelled first so
    /// crossed token streams cannot occur. Deliveries are forwarded to
    /// `sink`; the pump ends when the consumer is cancelled, the queue
    /// closes, or the sink is dropped.
    pub async fn acquire_stream(
        &self,
        queue: &str,
        tag: ConsumerTag,
        sink: mpsc::Sender<Value>,
    ) -> Result<ConsumerHandle, BusError> {
        if !self.bus.is_connected() {
            return Err(BusError::NotConnected);
        }

        // Free the slot before subscribing.
        let prior: Vec<u64> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, e)| {
                    e.streaming && e.user_id == tag.user_id && e.session_id == tag.session_id
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for id in prior {
            self.cancel(id);
        }

        let rx = self.bus.subscribe(queue).await?;
        let rendered = tag.render();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        self.entries.lock().insert(
            id,
            ConsumerEntry {
                tag: rendered.clone(),
                user_id: tag.user_id.clone(),
                session_id: tag.session_id.clone(),
                chat_id: Some(tag.chat_id.clone()),
                streaming: true,
                cancel: cancel.clone(),
            },
        );

        self.spawn_pump(id, rendered.clone(), rx, sink, cancel);
        Ok(ConsumerHandle { id, tag: rendered })
    }

    /// Subscribe to a queue for an auxiliary, on-demand consumer (session
    /// index or session history). Does not occupy a streaming slot.
    pub async fn acquire(
        &self,
        queue: &str,
        label: &str,
        sink: mpsc::Sender<Value>,
    ) -> Result<ConsumerHandle, BusError> {
        if !self.bus.is_connected() {
            return Err(BusError::NotConnected);
        }
        let rx = self.bus.subscribe(queue).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tag = format!("{label}_{id}");
        let cancel = CancellationToken::new();

        self.entries.lock().insert(
            id,
            ConsumerEntry {
                tag: tag.clone(),
                user_id: String::new(),
                session_id: String::new(),
                chat_id: None,
                streaming: false,
                cancel: cancel.clone(),
            },
        );

        self.spawn_pump(id, tag.clone(), rx, sink, cancel);
        Ok(ConsumerHandle { id, tag })
    }

    fn spawn_pump(
        &self,
        id: u64,
        tag: String,
        mut rx: mpsc::Receiver<Value>,
        sink: mpsc::Sender<Value>,
        cancel: CancellationToken,
    ) {
        let entries = self.entries.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    delivery = rx.recv() => {
                        match delivery {
                            Some(payload) => {
                                if sink.send(payload).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            entries.lock().remove(&id);
            debug!(target: "bus", consumer = %tag, "consumer pump ended");
        });
    }

    /// Cancel a consumer by handle id. The slot is freed unconditionally.
    pub fn cancel(&self, id: u64) -> bool {
        let entry = self.entries.lock().remove(&id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                debug!(target: "bus", consumer = %entry.tag, "consumer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel the first live streaming consumer matching the identifiers.
    /// With no `chat_id`, any chat in the session matches.
    pub fn cancel_for(&self, user_id: &str, session_id: &str, chat_id: Option<&str>) -> bool {
        let found = {
            let entries = self.entries.lock();
            entries
                .iter()
                .find(|(_, e)| {
                    e.streaming
                        && e.user_id == user_id
                        && e.session_id == session_id
                        && chat_id.map_or(true, |c| e.chat_id.as_deref() == Some(c))
                })
                .map(|(id, _)| *id)
        };
        match found {
            Some(id) => self.cancel(id),
            None => false,
        }
    }

    /// Cancel everything. Used by the logout flush and by shutdown.
    pub fn force_cleanup_all(&self) {
        let drained: Vec<ConsumerEntry> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, e)| e).collect()
        };
        for entry in &drained {
            entry.cancel.cancel();
        }
        if !drained.is_empty() {
            debug!(target: "bus", count = drained.len(), "cancelled all consumers");
        }
    }

    pub fn active_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether a streaming consumer currently holds the slot.
    pub fn has_slot(&self, user_id: &str, session_id: &str) -> bool {
        self.entries
            .lock()
            .values()
            .any(|e| e.streaming && e.user_id == user_id && e.session_id == session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use serde_json::json;
    use std::time::Duration;

    fn make_manager() -> (ConsumerManager, Arc<InProcessBus>) {
        let bus = Arc::new(InProcessBus::new());
        (ConsumerManager::new(bus.clone()), bus)
    }

    #[tokio::test]
    async fn test_acquire_and_receive() {
        let (manager, bus) = make_manager();
        let (tx, mut rx) = mpsc::channel(16);
        let tag = manager.make_tag("c1", "u1", "19", "1");
        manager.acquire_stream("chat", tag, tx).await.unwrap();

        bus.publish("chat", json!({"data": "x"})).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!({"data": "x"}));
    }

    #[tokio::test]
    async fn test_slot_is_exclusive() {
        let (manager, _bus) = make_manager();
        let (tx1, _rx1) = mpsc::channel(16);
        let (tx2, _rx2) = mpsc::channel(16);

        let tag1 = manager.make_tag("c1", "u1", "19", "1");
        let first = manager.acquire_stream("chat", tag1, tx1).await.unwrap();
        assert!(manager.has_slot("u1", "19"));

        let tag2 = manager.make_tag("c1", "u1", "19", "2");
        manager.acquire_stream("chat", tag2, tx2).await.unwrap();

        // Give the first pump a beat to observe cancellation.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.active_count(), 1);
        assert!(!manager.cancel(first.id), "prior occupant already gone");
    }

    #[tokio::test]
    async fn test_different_sessions_coexist() {
        let (manager, _bus) = make_manager();
        let (tx1, _rx1) = mpsc::channel(16);
        let (tx2, _rx2) = mpsc::channel(16);

        let tag1 = manager.make_tag("c1", "u1", "19", "1");
        manager.acquire_stream("chat", tag1, tx1).await.unwrap();
        let tag2 = manager.make_tag("c1", "u1", "20", "1");
        manager.acquire_stream("chat", tag2, tx2).await.unwrap();

        assert_eq!(manager.active_count(), 2);
    }

    #[tokio::test]
    async fn test_acquire_fails_when_disconnected() {
        let (manager, bus) = make_manager();
        bus.disconnect();
        let (tx, _rx) = mpsc::channel(16);
        let tag = manager.make_tag("c1", "u1", "19", "1");
        assert!(matches!(
            manager.acquire_stream("chat", tag, tx).await,
            Err(BusError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_cancel_for_matches_chat() {
        let (manager, _bus) = make_manager();
        let (tx, _rx) = mpsc::channel(16);
        let tag = manager.make_tag("c1", "u1", "19", "3");
        manager.acquire_stream("chat", tag, tx).await.unwrap();

        assert!(!manager.cancel_for("u1", "19", Some("2")));
        assert!(manager.cancel_for("u1", "19", Some("3")));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_for_without_chat_matches_session() {
        let (manager, _bus) = make_manager();
        let (tx, _rx) = mpsc::channel(16);
        let tag = manager.make_tag("c1", "u1", "19", "3");
        manager.acquire_stream("chat", tag, tx).await.unwrap();

        assert!(manager.cancel_for("u1", "19", None));
        assert!(!manager.cancel_for("u1", "19", None));
    }

    #[tokio::test]
    async fn test_cancel_keeps_bus_usable() {
        let (manager, bus) = make_manager();
        let (tx, _rx) = mpsc::channel(16);
        let tag = manager.make_tag("c1", "u1", "19", "1");
        let handle = manager.acquire_stream("chat", tag, tx).await.unwrap();
        manager.cancel(handle.id);

        assert!(bus.is_connected());
        assert!(bus.publish("chat", json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_force_cleanup_all() {
        let (manager, _bus) = make_manager();
        for session in ["19", "20", "21"] {
            let (tx, rx) = mpsc::channel(16);
            // Keep receivers alive past acquire.
            std::mem::forget(rx);
            let tag = manager.make_tag("c1", "u1", session, "1");
            manager.acquire_stream("chat", tag, tx).await.unwrap();
        }
        assert_eq!(manager.active_count(), 3);
        manager.force_cleanup_all();
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_aux_consumer_does_not_take_slot() {
        let (manager, _bus) = make_manager();
        let (tx, _rx) = mpsc::channel(16);
        manager
            .acquire("session_index", "session-index", tx)
            .await
            .unwrap();
        assert!(!manager.has_slot("", ""));
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_tag_format() {
        let tag = ConsumerTag {
            conn: "c9".to_string(),
            user_id: "u1".to_string(),
            session_id: "19".to_string(),
            chat_id: "2".to_string(),
            epoch: 7,
        };
        assert_eq!(tag.render(), "socket_c9_19_2_7");
    }
}
