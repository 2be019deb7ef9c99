//! Stage 1: library discovery, delegated to the scan coordinator.

use async_trait::async_trait;
use tracing::warn;
use vitrine_model::job::{ItemOutcome, JobStatus};
use vitrine_model::message::{MessageEnvelope, StagePayload, Topic};

use super::{StageWorker, WorkerContext};
use crate::coordinator::ScanCoordinator;
use crate::error::{CatalogError, Result};

pub struct LibraryScanWorker {
    coordinator: ScanCoordinator,
}

impl std::fmt::Debug for LibraryScanWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryScanWorker").finish_non_exhaustive()
    }
}

impl LibraryScanWorker {
    pub fn new(coordinator: ScanCoordinator) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl StageWorker for LibraryScanWorker {
    fn topic(&self) -> Topic {
        Topic::LibraryScan
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
    ) -> Result<()> {
        let StagePayload::LibraryScan { library_id, force } =
            &envelope.payload
        else {
            return Err(CatalogError::Internal(
                "library scan worker received foreign payload".to_string(),
            ));
        };
        let job = ctx.ledger.job(envelope.job_id).await?.ok_or_else(|| {
            CatalogError::NotFound(format!("job {}", envelope.job_id))
        })?;
        self.coordinator
            .execute_library_scan(&job, *library_id, *force)
            .await
    }

    async fn settle_failure(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
        _outcome: ItemOutcome,
        error: &str,
    ) {
        // Root-level failures are fatal for the whole scan.
        if let Err(err) = ctx
            .finish_job(
                envelope.job_id,
                JobStatus::Failed,
                Some(error.to_string()),
            )
            .await
        {
            warn!(
                target: "worker::library_scan",
                job = %envelope.job_id,
                error = %err,
                "failed to settle library scan failure"
            );
        }
    }
}
