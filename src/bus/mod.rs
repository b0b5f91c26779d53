//! Bus layer
//!
//! Upstream publishes token streams and session indexes into named queues
//! on a message broker; this module provides the broker seam, payload
//! decoding, and the consumer lifecycle manager that guarantees at most
//! one live subscription per streaming slot.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

mod broker;
pub mod consumer;
pub mod payload;

pub use broker::InProcessBus;
pub use consumer::{ConsumerHandle, ConsumerManager, ConsumerTag};
pub use payload::BusMessage;

/// Errors from bus operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("bus connection is not usable")]
    NotConnected,
    #[error("queue closed: {0}")]
    QueueClosed(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Broker seam. One process-wide connection with a shared channel used for
/// both consuming and publishing; cancelling a consumer never closes the
/// connection.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Subscribe to a queue. Dropping the receiver ends the subscription.
    async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<Value>, BusError>;

    /// Publish a payload to a queue.
    async fn publish(&self, queue: &str, payload: Value) -> Result<(), BusError>;

    /// Whether the underlying connection is currently usable.
    fn is_connected(&self) -> bool;
}
