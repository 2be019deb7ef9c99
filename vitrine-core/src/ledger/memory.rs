use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::warn;
use vitrine_model::ids::{CollectionId, JobId, LibraryId};
use vitrine_model::job::{ItemOutcome, JobKind, JobRecord, JobStatus};

use super::{JobLedger, StageCounter};
use crate::error::{CatalogError, Result};

/// In-memory ledger used by tests and the server's ephemeral mode.
#[derive(Default)]
pub struct MemoryLedger {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl std::fmt::Debug for MemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLedger").finish_non_exhaustive()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    async fn mutate<T>(
        &self,
        id: JobId,
        apply: impl FnOnce(&mut JobRecord) -> T + Send,
    ) -> Result<T> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| CatalogError::NotFound(format!("job {id}")))?;
        Ok(apply(job))
    }
}

#[async_trait]
impl JobLedger for MemoryLedger {
    async fn create_job(&self, job: &JobRecord) -> Result<()> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn job(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn children(&self, parent: JobId) -> Result<Vec<JobRecord>> {
        Ok(self
            .jobs
            .lock()
            .await
            .values()
            .filter(|job| job.parent_job_id == Some(parent))
            .cloned()
            .collect())
    }

    async fn find_active(
        &self,
        kind: JobKind,
        library: Option<LibraryId>,
        collection: Option<CollectionId>,
    ) -> Result<Option<JobRecord>> {
        Ok(self
            .jobs
            .lock()
            .await
            .values()
            .filter(|job| {
                job.kind == kind
                    && !job.is_terminal()
                    && library.is_none_or(|l| job.target_library() == Some(l))
                    && collection
                        .is_none_or(|c| job.target_collection() == Some(c))
            })
            .max_by_key(|job| job.created_at)
            .cloned())
    }

    async fn mark_running(&self, id: JobId) -> Result<()> {
        self.mutate(id, |job| {
            if job.is_terminal() {
                warn!(
                    target: "ledger",
                    job = %id,
                    status = ?job.status,
                    "ignoring mark_running on terminal job"
                );
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
        debug_assert!(status.is_terminal());
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
        let mut jobs = self.jobs.lock().await;
        if !jobs.contains_key(&id) {
            return Err(CatalogError::NotFound(format!("job {id}")));
        }

        let mut cancelled = Vec::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            let child_ids: Vec<JobId> = jobs
                .values()
                .filter(|job| job.parent_job_id == Some(current))
                .map(|job| job.id)
                .collect();
            frontier.extend(child_ids);

            if let Some(job) = jobs.get_mut(&current)
                && !job.is_terminal()
            {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                cancelled.push(current);
            }
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{is_fully_settled, settled_status};
    use serde_json::Value;
    use uuid::Uuid;

    fn scan_job(library: LibraryId) -> JobRecord {
        JobRecord::new(JobKind::LibraryScan, Uuid::now_v7(), 60_000)
            .with_parameter("library_id", Value::String(library.to_string()))
    }

    #[tokio::test]
    async fn terminal_jobs_are_immutable() {
        let ledger = MemoryLedger::new();
        let job = scan_job(LibraryId::new());
        let id = job.id;
        ledger.create_job(&job).await.unwrap();
        ledger.mark_running(id).await.unwrap();
        ledger.finish(id, JobStatus::Completed, None).await.unwrap();

        ledger.add_total(id, 5).await.unwrap();
        ledger.finish(id, JobStatus::Failed, None).await.unwrap();
        let stored = ledger.job(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.progress.total, 0);
    }

    #[tokio::test]
    async fn find_active_coalesces_by_library_target() {
        let ledger = MemoryLedger::new();
        let library = LibraryId::new();
        let job = scan_job(library);
        ledger.create_job(&job).await.unwrap();
        ledger.mark_running(job.id).await.unwrap();

        let found = ledger
            .find_active(JobKind::LibraryScan, Some(library), None)
            .await
            .unwrap();
        assert_eq!(found.map(|j| j.id), Some(job.id));

        let other = ledger
            .find_active(JobKind::LibraryScan, Some(LibraryId::new()), None)
            .await
            .unwrap();
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn the_last_settled_item_completes_the_job() {
        let ledger = MemoryLedger::new();
        let job = scan_job(LibraryId::new());
        let id = job.id;
        ledger.create_job(&job).await.unwrap();
        ledger.mark_running(id).await.unwrap();
        ledger.add_total(id, 2).await.unwrap();

        let first = ledger
            .record_item(id, ItemOutcome::Completed, Some("a".into()))
            .await
            .unwrap();
        assert!(!is_fully_settled(&first));

        let second = ledger
            .record_item(id, ItemOutcome::Failed, Some("b".into()))
            .await
            .unwrap();
        assert!(is_fully_settled(&second));
        assert_eq!(settled_status(&second), JobStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_tree_reaches_non_terminal_descendants() {
        let ledger = MemoryLedger::new();
        let parent = scan_job(LibraryId::new());
        let child = JobRecord::new(
            JobKind::CollectionScan,
            parent.correlation_id,
            60_000,
        )
        .with_parent(parent.id);
        let done_child = {
            let mut job = JobRecord::new(
                JobKind::Thumbnail,
                parent.correlation_id,
                60_000,
            )
            .with_parent(parent.id);
            job.status = JobStatus::Completed;
            job
        };
        ledger.create_job(&parent).await.unwrap();
        ledger.create_job(&child).await.unwrap();
        ledger.create_job(&done_child).await.unwrap();

        let cancelled = ledger.cancel_tree(parent.id).await.unwrap();
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.contains(&parent.id));
        assert!(cancelled.contains(&child.id));
        let untouched = ledger.job(done_child.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Completed);
    }
}
