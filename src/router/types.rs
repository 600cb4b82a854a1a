use super::RouterError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A message handed to a consumer. It stays owned by the router until the
/// consumer acks or nacks `tag`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// Pull handle for a bound queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueHandle(pub String);

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Publish/subscribe operations shared by the in-process `Broker` and the
/// HTTP `RemoteRouter`.
#[async_trait]
pub trait MessageRouter: Send + Sync {
    /// Ensures the exchange exists. Idempotent.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), RouterError>;

    /// Ensures `queue` exists and receives what `exchange` publishes under
    /// `routing_key`. Idempotent.
    async fn bind_queue(
        &self,
        exchange: &str,
        routing_key: &str,
        queue: &str,
    ) -> Result<QueueHandle, RouterError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), RouterError>;

    /// Publishes under the exchange's next routing key in rotation and
    /// returns the key used.
    async fn publish_next_routing_key(
        &self,
        exchange: &str,
        body: Vec<u8>,
    ) -> Result<String, RouterError>;

    /// Waits up to `timeout` for a message.
    async fn consume(
        &self,
        queue: &QueueHandle,
        timeout: Duration,
    ) -> Result<Option<Delivery>, RouterError>;

    async fn ack(&self, queue: &QueueHandle, tag: u64) -> Result<(), RouterError>;

    /// Returns the delivery to the front of the queue for redelivery.
    async fn nack(&self, queue: &QueueHandle, tag: u64) -> Result<(), RouterError>;

    /// Requeues every unacked delivery of the queue. Returns how many.
    async fn recover(&self, queue: &QueueHandle) -> Result<usize, RouterError>;

    /// Messages not yet acked: waiting plus in flight.
    async fn pending_count(&self, queue: &QueueHandle) -> Result<usize, RouterError>;
}
