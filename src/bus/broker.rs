//! In-process broker
//!
//! A single shared broker with per-queue subscriber lists. Dropping a
//! subscriber's receiver ends its subscription; the broker itself stays
//! open so publishing keeps working across consumer cancellations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Bus, BusError};

/// Per-subscriber buffer depth. A slow consumer drops its oldest backlog
/// rather than stalling the publisher.
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Default)]
struct Queues {
    subscribers: HashMap<String, Vec<mpsc::Sender<Value>>>,
}

/// Process-wide in-memory broker.
pub struct InProcessBus {
    queues: Mutex<Queues>,
    connected: AtomicBool,
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessBus {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate a connection loss. Subsequent subscribes and publishes fail
    /// until [`InProcessBus::reconnect`] is called.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Number of live subscribers on a queue.
    pub fn subscriber_count(&self, queue: &str) -> usize {
        let mut queues = self.queues.lock();
        if let Some(subs) = queues.subscribers.get_mut(queue) {
            subs.retain(|tx| !tx.is_closed());
            subs.len()
        } else {
            0
        }
    }
}

#[async_trait]
impl Bus for InProcessBus {
    async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<Value>, BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.queues
            .lock()
            .subscribers
            .entry(queue.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn publish(&self, queue: &str, payload: Value) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let senders: Vec<mpsc::Sender<Value>> = {
            let mut queues = self.queues.lock();
            let Some(subs) = queues.subscribers.get_mut(queue) else {
                return Ok(());
            };
            subs.retain(|tx| !tx.is_closed());
            subs.clone()
        };
        for tx in senders {
            // try_send: a wedged subscriber must not stall the broker.
            let _ = tx.try_send(payload.clone());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = InProcessBus::new();
        let mut rx = bus.subscribe("chat").await.unwrap();
        bus.publish("chat", json!({"data": "x"})).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!({"data": "x"}));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InProcessBus::new();
        assert!(bus.publish("chat", json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropping_receiver_ends_subscription() {
        let bus = InProcessBus::new();
        let rx = bus.subscribe("chat").await.unwrap();
        assert_eq!(bus.subscriber_count("chat"), 1);
        drop(rx);
        bus.publish("chat", json!({})).await.unwrap();
        assert_eq!(bus.subscriber_count("chat"), 0);
    }

    #[tokio::test]
    async fn test_broker_survives_subscriber_churn() {
        let bus = InProcessBus::new();
        let rx = bus.subscribe("chat").await.unwrap();
        drop(rx);
        // The queue is still usable for a fresh subscriber.
        let mut rx2 = bus.subscribe("chat").await.unwrap();
        bus.publish("chat", json!({"data": "y"})).await.unwrap();
        assert_eq!(rx2.recv().await.unwrap(), json!({"data": "y"}));
    }

    #[tokio::test]
    async fn test_disconnect_fails_operations() {
        let bus = InProcessBus::new();
        bus.disconnect();
        assert!(!bus.is_connected());
        assert!(matches!(
            bus.subscribe("chat").await,
            Err(BusError::NotConnected)
        ));
        assert!(matches!(
            bus.publish("chat", json!({})).await,
            Err(BusError::NotConnected)
        ));

        bus.reconnect();
        assert!(bus.subscribe("chat").await.is_ok());
    }

    #[tokio::test]
    async fn test_fanout_to_multiple_subscribers() {
        let bus = InProcessBus::new();
        let mut rx1 = bus.subscribe("chat").await.unwrap();
        let mut rx2 = bus.subscribe("chat").await.unwrap();
        bus.publish("chat", json!({"data": "z"})).await.unwrap();
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }
}
