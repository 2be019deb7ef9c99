//! Durable Postgres-backed bus: `FOR UPDATE SKIP LOCKED` dequeue, leases
//! expressed as row state, dead letters kept in the same table.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use uuid::Uuid;
use vitrine_model::message::{MessageEnvelope, Topic};

use super::{DeadLetter, Delivery, DeliveryTag, MessageBus};
use crate::config::RetryConfig;
use crate::error::{CatalogError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn storage_err(err: sqlx::Error) -> CatalogError {
    CatalogError::Storage(err.to_string())
}

fn decode(doc: Value) -> Result<MessageEnvelope> {
    serde_json::from_value(doc).map_err(|err| {
        CatalogError::Storage(format!("message decode: {err}"))
    })
}

fn encode(envelope: &MessageEnvelope) -> Result<Value> {
    serde_json::to_value(envelope).map_err(|err| {
        CatalogError::Storage(format!("message encode: {err}"))
    })
}

#[derive(Clone)]
pub struct PostgresBus {
    pool: PgPool,
    capacity: usize,
    retry: RetryConfig,
}

impl std::fmt::Debug for PostgresBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBus")
            .field("capacity", &self.capacity)
            .field("retry", &self.retry)
            .finish()
    }
}

impl PostgresBus {
    pub fn new(pool: PgPool, capacity: usize, retry: RetryConfig) -> Self {
        Self {
            pool,
            capacity: capacity.max(1),
            retry,
        }
    }

    fn backoff_with_jitter(&self, attempt: u32) -> chrono::Duration {
        let base = self.retry.backoff_ms(attempt);
        let jitter = rand::rng().random_range(0..=base / 4);
        chrono::Duration::milliseconds((base + jitter) as i64)
    }

    async fn try_receive(&self, topic: Topic) -> Result<Option<Delivery>> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let Some(row) = sqlx::query(
            r#"
            SELECT token, doc FROM bus_messages
            WHERE topic = $1 AND state = 'ready' AND available_at <= now()
            ORDER BY available_at, created_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(topic.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?
        else {
            return Ok(None);
        };

        let token: Uuid = row.get("token");
        let mut envelope = decode(row.get("doc"))?;
        envelope.attempt += 1;

        sqlx::query(
            r#"
            UPDATE bus_messages
            SET state = 'leased', attempt = $2, doc = $3
            WHERE token = $1
            "#,
        )
        .bind(token)
        .bind(envelope.attempt as i32)
        .bind(encode(&envelope)?)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;

        Ok(Some(Delivery {
            envelope,
            tag: DeliveryTag { topic, token },
        }))
    }
}

#[async_trait]
impl MessageBus for PostgresBus {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<()> {
        let topic = envelope.topic();
        let ready: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM bus_messages WHERE topic = $1 AND state = 'ready'",
        )
        .bind(topic.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        let state = if ready as usize >= self.capacity {
            "dead"
        } else {
            "ready"
        };

        sqlx::query(
            r#"
            INSERT INTO bus_messages
                (token, topic, state, attempt, available_at, error, doc)
            VALUES ($1, $2, $3, $4, now(), $5, $6)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(topic.as_str())
        .bind(state)
        .bind(envelope.attempt as i32)
        .bind((state == "dead").then(|| "queue overflow".to_string()))
        .bind(encode(&envelope)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn receive(
        &self,
        topic: Topic,
        wait: Duration,
    ) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_receive(topic).await? {
                return Ok(Some(delivery));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(wait)).await;
        }
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<()> {
        sqlx::query(
            "DELETE FROM bus_messages WHERE token = $1 AND state = 'leased'",
        )
        .bind(tag.token)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn nack(
        &self,
        tag: &DeliveryTag,
        retryable: bool,
        error: Option<String>,
    ) -> Result<()> {
        let row = sqlx::query(
            "SELECT attempt FROM bus_messages WHERE token = $1 AND state = 'leased'",
        )
        .bind(tag.token)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        let Some(row) = row else {
            return Ok(());
        };
        let attempt = row.get::<i32, _>("attempt") as u32;

        if retryable && attempt < self.retry.max_attempts {
            let available_at = Utc::now() + self.backoff_with_jitter(attempt);
            sqlx::query(
                r#"
                UPDATE bus_messages
                SET state = 'ready', available_at = $2, error = $3
                WHERE token = $1
                "#,
            )
            .bind(tag.token)
            .bind(available_at)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        } else {
            sqlx::query(
                "UPDATE bus_messages SET state = 'dead', error = $2 WHERE token = $1",
            )
            .bind(tag.token)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        }
        Ok(())
    }

    async fn depth(&self, topic: Topic) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM bus_messages
            WHERE topic = $1 AND state IN ('ready', 'leased')
            "#,
        )
        .bind(topic.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(count as usize)
    }

    async fn dead_letters(&self, topic: Topic) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT doc, error, created_at FROM bus_messages
            WHERE topic = $1 AND state = 'dead'
            ORDER BY created_at
            "#,
        )
        .bind(topic.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter()
            .map(|row| {
                Ok(DeadLetter {
                    envelope: decode(row.get("doc"))?,
                    error: row.get("error"),
                    dead_at: row.get("created_at"),
                })
            })
            .collect()
    }
}
