//! Durable topic/queue transport consumed by the worker pools.
//!
//! One topic per pipeline stage, each with a primary queue and a
//! dead-letter queue. Delivery is at-least-once with manual acknowledgment:
//! a received message stays leased until `ack` or `nack`, and a `nack`
//! either requeues with backoff or dead-letters once the attempt budget is
//! spent.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vitrine_model::message::{MessageEnvelope, Topic};

use crate::error::Result;

pub use memory::MemoryBus;
#[cfg(feature = "database")]
pub use postgres::PostgresBus;

/// Handle identifying one in-flight delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTag {
    pub topic: Topic,
    pub token: Uuid,
}

/// A leased message awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: MessageEnvelope,
    pub tag: DeliveryTag,
}

/// A message that exhausted its attempts or failed non-retryably.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope: MessageEnvelope,
    pub error: Option<String>,
    pub dead_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Enqueue onto the payload's topic. When the primary queue is at
    /// capacity the message overflows to the dead-letter queue.
    async fn publish(&self, envelope: MessageEnvelope) -> Result<()>;

    /// Wait up to `wait` for a deliverable message.
    async fn receive(
        &self,
        topic: Topic,
        wait: Duration,
    ) -> Result<Option<Delivery>>;

    async fn ack(&self, tag: &DeliveryTag) -> Result<()>;

    /// Negative acknowledgment. Retryable failures requeue with backoff
    /// until the attempt budget is spent; others dead-letter immediately.
    async fn nack(
        &self,
        tag: &DeliveryTag,
        retryable: bool,
        error: Option<String>,
    ) -> Result<()>;

    /// Ready + in-flight message count of the primary queue.
    async fn depth(&self, topic: Topic) -> Result<usize>;

    async fn dead_letters(&self, topic: Topic) -> Result<Vec<DeadLetter>>;
}
