//! Postgres job ledger. Every mutation is a row-locked read-modify-write
//! so the progress invariants survive concurrent workers.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::warn;
use vitrine_model::ids::{CollectionId, JobId, LibraryId};
use vitrine_model::job::{ItemOutcome, JobKind, JobRecord, JobStatus};

use super::{JobLedger, StageCounter};
use crate::error::{CatalogError, Result};

fn storage_err(err: sqlx::Error) -> CatalogError {
    CatalogError::Storage(err.to_string())
}

fn decode(doc: Value) -> Result<JobRecord> {
    serde_json::from_value(doc)
        .map_err(|err| CatalogError::Storage(format!("job decode: {err}")))
}

fn encode(job: &JobRecord) -> Result<Value> {
    serde_json::to_value(job)
        .map_err(|err| CatalogError::Storage(format!("job encode: {err}")))
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresLedger")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Row-locked read-modify-write; the closure mutates the decoded
    /// record, which is then written back with its extracted columns.
    async fn mutate<T>(
        &self,
        id: JobId,
        apply: impl FnOnce(&mut JobRecord) -> T + Send,
    ) -> Result<T> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let row = sqlx::query("SELECT doc FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| CatalogError::NotFound(format!("job {id}")))?;

        let mut job = decode(row.get("doc"))?;
        let value = apply(&mut job);

        sqlx::query("UPDATE jobs SET doc = $2, status = $3 WHERE id = $1")
            .bind(id.0)
            .bind(encode(&job)?)
            .bind(status_str(job.status))
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(value)
    }
}

#[async_trait]
impl JobLedger for PostgresLedger {
    async fn create_job(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, kind, status, parent_job_id, library_id, collection_id,
                 created_at, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.id.0)
        .bind(job.kind.to_string())
        .bind(status_str(job.status))
        .bind(job.parent_job_id.map(|parent| parent.0))
        .bind(job.target_library().map(|library| library.0))
        .bind(job.target_collection().map(|collection| collection.0))
        .bind(job.created_at)
        .bind(encode(job)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn job(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT doc FROM jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|row| decode(row.get("doc"))).transpose()
    }

    async fn children(&self, parent: JobId) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query("SELECT doc FROM jobs WHERE parent_job_id = $1")
            .bind(parent.0)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.into_iter().map(|row| decode(row.get("doc"))).collect()
    }

    async fn find_active(
        &self,
        kind: JobKind,
        library: Option<LibraryId>,
        collection: Option<CollectionId>,
    ) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM jobs
            WHERE kind = $1
              AND status IN ('pending', 'running')
              AND ($2::uuid IS NULL OR library_id = $2)
              AND ($3::uuid IS NULL OR collection_id = $3)
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(kind.to_string())
        .bind(library.map(|library| library.0))
        .bind(collection.map(|collection| collection.0))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.map(|row| decode(row.get("doc"))).transpose()
    }

    async fn mark_running(&self, id: JobId) -> Result<()> {
        self.mutate(id, |job| {
            if job.is_terminal() {
                return;
            }
            job.status = JobStatus::Running;
            job.attempts += 1;
            job.started_at.get_or_insert_with(Utc::now);
        })
        .await
    }

    async fn finish(
        &self,
        id: JobId,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.mutate(id, |job| {
            if job.is_terminal() {
                return;
            }
            job.status = status;
            job.completed_at = Some(Utc::now());
            job.error = error;
        })
        .await
    }

    async fn add_total(&self, id: JobId, delta: u64) -> Result<()> {
        self.mutate(id, |job| {
            if job.is_terminal() {
                return;
            }
            job.progress.total += delta;
        })
        .await
    }

    async fn record_item(
        &self,
        id: JobId,
        outcome: ItemOutcome,
        current_item: Option<String>,
    ) -> Result<JobRecord> {
        self.mutate(id, |job| {
            if !job.is_terminal() {
                job.progress.record(outcome);
                job.progress.current_item = current_item;
            }
            job.clone()
        })
        .await
    }

    async fn increment_stage(
        &self,
        id: JobId,
        counter: StageCounter,
    ) -> Result<()> {
        self.mutate(id, |job| {
            if job.is_terminal() {
                return;
            }
            match counter {
                StageCounter::Thumbnails => {
                    job.stage_counters.thumbnails_done += 1;
                }
                StageCounter::Cache => job.stage_counters.cache_done += 1,
            }
        })
        .await
    }

    async fn cancel_tree(&self, id: JobId) -> Result<Vec<JobId>> {
        if self.job(id).await?.is_none() {
            return Err(CatalogError::NotFound(format!("job {id}")));
        }

        let mut cancelled = Vec::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            let child_rows =
                sqlx::query("SELECT id FROM jobs WHERE parent_job_id = $1")
                    .bind(current.0)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(storage_err)?;
            frontier.extend(
                child_rows
                    .into_iter()
                    .map(|row| JobId(row.get::<uuid::Uuid, _>("id"))),
            );

            let was_cancelled = self
                .mutate(current, |job| {
                    if job.is_terminal() {
                        return false;
                    }
                    job.status = JobStatus::Cancelled;
                    job.completed_at = Some(Utc::now());
                    true
                })
                .await;
            match was_cancelled {
                Ok(true) => cancelled.push(current),
                Ok(false) => {}
                Err(err) => warn!(
                    target: "ledger::postgres",
                    job = %current,
                    error = %err,
                    "failed to cancel descendant"
                ),
            }
        }
        Ok(cancelled)
    }
}
