use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;
use vitrine_model::message::{MessageEnvelope, Topic};

use super::{DeadLetter, Delivery, DeliveryTag, MessageBus};
use crate::config::RetryConfig;
use crate::error::Result;

#[derive(Debug)]
struct ReadyMessage {
    envelope: MessageEnvelope,
    available_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TopicState {
    ready: Vec<ReadyMessage>,
    inflight: HashMap<Uuid, MessageEnvelope>,
    dead: Vec<DeadLetter>,
}

#[derive(Debug, Default)]
struct TopicQueue {
    state: Mutex<TopicState>,
    notify: Notify,
}

/// Bounded in-process broker with per-topic dead-letter queues.
pub struct MemoryBus {
    topics: HashMap<Topic, TopicQueue>,
    capacity: usize,
    retry: RetryConfig,
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field("capacity", &self.capacity)
            .field("retry", &self.retry)
            .finish()
    }
}

impl MemoryBus {
    pub fn new(capacity: usize, retry: RetryConfig) -> Self {
        let topics = Topic::ALL
            .into_iter()
            .map(|topic| (topic, TopicQueue::default()))
            .collect();
        Self {
            topics,
            capacity: capacity.max(1),
            retry,
        }
    }

    fn queue(&self, topic: Topic) -> &TopicQueue {
        // The map is populated for every topic at construction.
        &self.topics[&topic]
    }

    fn backoff_with_jitter(&self, attempt: u32) -> chrono::Duration {
        let base = self.retry.backoff_ms(attempt);
        let jitter = rand::rng().random_range(0..=base / 4);
        chrono::Duration::milliseconds((base + jitter) as i64)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<()> {
        let topic = envelope.topic();
        let queue = self.queue(topic);
        let mut state = queue.state.lock().await;
        if state.ready.len() >= self.capacity {
            warn!(
                target: "bus::memory",
                topic = %topic,
                message = %envelope.message_id,
                "queue at capacity; overflowing to dead letters"
            );
            state.dead.push(DeadLetter {
                envelope,
                error: Some("queue overflow".to_string()),
                dead_at: Utc::now(),
            });
            return Ok(());
        }
        state.ready.push(ReadyMessage {
            envelope,
            available_at: Utc::now(),
        });
        drop(state);
        queue.notify.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        topic: Topic,
        wait: Duration,
    ) -> Result<Option<Delivery>> {
        let queue = self.queue(topic);
        let deadline = Instant::now() + wait;

        loop {
            let next_available = {
                let mut state = queue.state.lock().await;
                let now = Utc::now();
                let due = state
                    .ready
                    .iter()
                    .enumerate()
                    .filter(|(_, msg)| msg.available_at <= now)
                    .min_by_key(|(_, msg)| {
                        (msg.available_at, msg.envelope.created_at)
                    })
                    .map(|(index, _)| index);

                if let Some(index) = due {
                    let mut message = state.ready.remove(index);
                    message.envelope.attempt += 1;
                    let token = Uuid::now_v7();
                    state
                        .inflight
                        .insert(token, message.envelope.clone());
                    return Ok(Some(Delivery {
                        envelope: message.envelope,
                        tag: DeliveryTag { topic, token },
                    }));
                }

                state
                    .ready
                    .iter()
                    .map(|msg| msg.available_at)
                    .min()
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut sleep_for = deadline - now;
            if let Some(at) = next_available {
                let until_due = (at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                sleep_for = sleep_for.min(until_due.max(Duration::from_millis(1)));
            }

            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<()> {
        let queue = self.queue(tag.topic);
        let mut state = queue.state.lock().await;
        if state.inflight.remove(&tag.token).is_none() {
            warn!(
                target: "bus::memory",
                topic = %tag.topic,
                "ack for unknown delivery token"
            );
        }
        Ok(())
    }

    async fn nack(
        &self,
        tag: &DeliveryTag,
        retryable: bool,
        error: Option<String>,
    ) -> Result<()> {
        let queue = self.queue(tag.topic);
        let mut state = queue.state.lock().await;
        let Some(envelope) = state.inflight.remove(&tag.token) else {
            warn!(
                target: "bus::memory",
                topic = %tag.topic,
                "nack for unknown delivery token"
            );
            return Ok(());
        };

        if retryable && envelope.attempt < self.retry.max_attempts {
            let available_at =
                Utc::now() + self.backoff_with_jitter(envelope.attempt);
            state.ready.push(ReadyMessage {
                envelope,
                available_at,
            });
            drop(state);
            queue.notify.notify_waiters();
        } else {
            state.dead.push(DeadLetter {
                envelope,
                error,
                dead_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn depth(&self, topic: Topic) -> Result<usize> {
        let state = self.queue(topic).state.lock().await;
        Ok(state.ready.len() + state.inflight.len())
    }

    async fn dead_letters(&self, topic: Topic) -> Result<Vec<DeadLetter>> {
        Ok(self.queue(topic).state.lock().await.dead.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitrine_model::ids::{JobId, LibraryId};
    use vitrine_model::message::StagePayload;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            backoff_min_ms: 1,
            backoff_max_ms: 4,
        }
    }

    fn scan_message() -> MessageEnvelope {
        MessageEnvelope::new(
            Uuid::now_v7(),
            JobId::new(),
            StagePayload::LibraryScan {
                library_id: LibraryId::new(),
                force: false,
            },
        )
    }

    #[tokio::test]
    async fn publish_receive_ack_round_trip() {
        let bus = MemoryBus::new(16, fast_retry());
        let message = scan_message();
        bus.publish(message.clone()).await.unwrap();

        let delivery = bus
            .receive(Topic::LibraryScan, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope.message_id, message.message_id);
        assert_eq!(delivery.envelope.attempt, 1);

        bus.ack(&delivery.tag).await.unwrap();
        assert_eq!(bus.depth(Topic::LibraryScan).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retryable_nacks_redeliver_then_dead_letter() {
        let bus = MemoryBus::new(16, fast_retry());
        bus.publish(scan_message()).await.unwrap();

        let first = bus
            .receive(Topic::LibraryScan, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        bus.nack(&first.tag, true, Some("io".into())).await.unwrap();

        let second = bus
            .receive(Topic::LibraryScan, Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.envelope.attempt, 2);

        bus.nack(&second.tag, true, Some("io again".into()))
            .await
            .unwrap();
        assert!(
            bus.receive(Topic::LibraryScan, Duration::from_millis(50))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(bus.dead_letters(Topic::LibraryScan).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_retryable_nacks_dead_letter_immediately() {
        let bus = MemoryBus::new(16, fast_retry());
        bus.publish(scan_message()).await.unwrap();
        let delivery = bus
            .receive(Topic::LibraryScan, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        bus.nack(&delivery.tag, false, Some("corrupt".into()))
            .await
            .unwrap();

        let dead = bus.dead_letters(Topic::LibraryScan).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error.as_deref(), Some("corrupt"));
    }

    #[tokio::test]
    async fn overflow_goes_to_the_dead_letter_queue() {
        let bus = MemoryBus::new(1, fast_retry());
        bus.publish(scan_message()).await.unwrap();
        bus.publish(scan_message()).await.unwrap();

        assert_eq!(bus.depth(Topic::LibraryScan).await.unwrap(), 1);
        assert_eq!(bus.dead_letters(Topic::LibraryScan).await.unwrap().len(), 1);
    }
}
