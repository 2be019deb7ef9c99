//! Worker consumer substrate: one pool per message topic, pulling with
//! manual acknowledgment, executing the stage operation, and writing
//! results back with version-conditional updates.
//!
//! Delivery is at-least-once: every stage operation is idempotent and every
//! message for a terminal job is acknowledged without side effects.

pub mod bulk;
pub mod collection_scan;
pub mod derivative;
pub mod library_scan;
pub mod metadata;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vitrine_model::collection::Collection;
use vitrine_model::ids::{CollectionId, JobId};
use vitrine_model::index::IndexEntry;
use vitrine_model::job::{ItemOutcome, JobKind, JobStatus};
use vitrine_model::message::{MessageEnvelope, Topic};

use crate::archive::ArchiveStore;
use crate::bus::{Delivery, MessageBus};
use crate::cache_folder::CacheFolderAllocator;
use crate::config::PipelineConfig;
use crate::derivative::DerivativeEngine;
use crate::error::{CatalogError, Result, Retryability};
use crate::index::CollectionIndex;
use crate::ledger::{
    JobLedger, StageCounter, is_fully_settled, settled_status,
};
use crate::store::{CatalogStore, ProcessingStage, StageState};
use crate::walker::{FileSystem, Walker};

pub use bulk::BulkWorker;
pub use collection_scan::CollectionScanWorker;
pub use derivative::DerivativeWorker;
pub use library_scan::LibraryScanWorker;
pub use metadata::MetadataWorker;

/// Everything a stage operation needs, cloned into each worker task.
#[derive(Clone)]
pub struct WorkerContext {
    pub catalog: CatalogStore,
    pub ledger: Arc<dyn JobLedger>,
    pub bus: Arc<dyn MessageBus>,
    pub index: Arc<dyn CollectionIndex>,
    pub archives: ArchiveStore,
    pub engine: DerivativeEngine,
    pub allocator: CacheFolderAllocator,
    pub walker: Arc<Walker<Arc<dyn FileSystem>>>,
    pub config: Arc<PipelineConfig>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext").finish_non_exhaustive()
    }
}

impl WorkerContext {
    /// Load-apply-store with version CAS; on conflict, re-read and re-apply
    /// up to the configured budget. Every successful authoritative write is
    /// followed by an index upsert in the same worker, preserving write
    /// order per collection.
    pub async fn mutate_collection<T, F>(
        &self,
        id: CollectionId,
        mut apply: F,
    ) -> Result<T>
    where
        T: Send,
        F: FnMut(&mut Collection) -> Result<T> + Send,
    {
        let budget = self.config.workers.conflict_retry_budget;
        let mut attempt = 0;
        loop {
            let mut collection = self
                .catalog
                .collections
                .collection(id)
                .await?
                .ok_or_else(|| {
                    CatalogError::NotFound(format!("collection {id}"))
                })?;
            let value = apply(&mut collection)?;
            collection.touch();

            match self
                .catalog
                .collections
                .update_collection(&mut collection)
                .await
            {
                Ok(()) => {
                    self.refresh_index_entry(&collection).await?;
                    return Ok(value);
                }
                Err(CatalogError::VersionConflict { .. })
                    if attempt < budget =>
                {
                    attempt += 1;
                    debug!(
                        target: "worker::substrate",
                        collection = %id,
                        attempt,
                        "version conflict; re-reading"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fetch a media item's bytes from disk or from inside its archive.
    pub async fn source_bytes(
        &self,
        source: &vitrine_model::collection::SourceLocator,
    ) -> Result<Vec<u8>> {
        use vitrine_model::collection::SourceLocator;
        match source {
            SourceLocator::Path { path } => Ok(tokio::fs::read(path).await?),
            SourceLocator::ArchiveEntry {
                archive_path,
                entry_name,
            } => {
                let collection = self
                    .catalog
                    .collections
                    .collection_by_path(archive_path)
                    .await?
                    .ok_or_else(|| {
                        CatalogError::NotFound(format!(
                            "archive collection {}",
                            archive_path.display()
                        ))
                    })?;
                self.archives
                    .read_entry(archive_path, collection.kind, entry_name)
                    .await
            }
        }
    }

    /// Mirror the collection's authoritative state into the ordered index,
    /// carrying the stored preview forward.
    pub async fn refresh_index_entry(
        &self,
        collection: &Collection,
    ) -> Result<()> {
        if collection.deleted {
            return self.index.remove_entry(collection.id).await;
        }
        let preview = self
            .index
            .entry(collection.id)
            .await
            .ok()
            .flatten()
            .and_then(|entry| entry.thumbnail_preview);
        self.index
            .upsert_entry(&IndexEntry::from_collection(collection, preview))
            .await
    }

    /// Finish a job and, for collection scans, bubble the outcome into the
    /// parent library scan.
    pub async fn finish_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.ledger.finish(job_id, status, error).await?;
        let Some(job) = self.ledger.job(job_id).await? else {
            return Ok(());
        };
        if job.kind != JobKind::CollectionScan {
            return Ok(());
        }
        let Some(parent_id) = job.parent_job_id else {
            return Ok(());
        };
        let outcome = match job.status {
            JobStatus::Completed => ItemOutcome::Completed,
            JobStatus::Failed => ItemOutcome::Failed,
            JobStatus::Cancelled => ItemOutcome::Skipped,
            _ => return Ok(()),
        };
        let parent = self
            .ledger
            .record_item(parent_id, outcome, Some(job_id.to_string()))
            .await?;
        if is_fully_settled(&parent) {
            self.ledger
                .finish(parent_id, settled_status(&parent), None)
                .await?;
        }
        Ok(())
    }

    /// Settle one processing stage for a media item. When that settles the
    /// whole item, its outcome is recorded on the owning scan job, and the
    /// scan job finishes once all of its items have settled.
    pub async fn settle_stage(
        &self,
        collection_id: CollectionId,
        media_item_id: vitrine_model::ids::MediaItemId,
        stage: ProcessingStage,
        state: StageState,
    ) -> Result<()> {
        let settlement = match self
            .catalog
            .processing
            .settle_stage(collection_id, media_item_id, stage, state)
            .await
        {
            Ok(settlement) => settlement,
            Err(CatalogError::NotFound(_)) => {
                // A rescan cleared the state; the message is stale.
                debug!(
                    target: "worker::substrate",
                    collection = %collection_id,
                    media_item = %media_item_id,
                    "stage settled for unknown processing state"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let Some(scan_job_id) = settlement.record.scan_job_id else {
            return Ok(());
        };
        if state == StageState::Completed {
            match stage {
                ProcessingStage::Thumbnail => {
                    self.ledger
                        .increment_stage(scan_job_id, StageCounter::Thumbnails)
                        .await?;
                }
                ProcessingStage::Cache => {
                    self.ledger
                        .increment_stage(scan_job_id, StageCounter::Cache)
                        .await?;
                }
                ProcessingStage::Metadata => {}
            }
        }

        if settlement.newly_settled {
            let scan_job = self
                .ledger
                .record_item(
                    scan_job_id,
                    settlement.record.outcome(),
                    Some(media_item_id.to_string()),
                )
                .await?;
            if is_fully_settled(&scan_job) {
                self.finish_job(
                    scan_job_id,
                    settled_status(&scan_job),
                    None,
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// One pipeline stage's message handler.
#[async_trait]
pub trait StageWorker: Send + Sync + 'static {
    fn topic(&self) -> Topic;

    /// Execute the stage; success implies all bookkeeping for the happy
    /// path is done.
    async fn process(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
    ) -> Result<()>;

    /// Settle ledger/processing bookkeeping for a message that will not be
    /// retried again.
    async fn settle_failure(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
        outcome: ItemOutcome,
        error: &str,
    );
}

/// Spawn the configured number of consumer tasks for one stage.
pub fn spawn_stage(
    ctx: Arc<WorkerContext>,
    worker: Arc<dyn StageWorker>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let topic = worker.topic();
    let concurrency = ctx.config.workers.concurrency_for(topic);
    info!(
        target: "worker::substrate",
        topic = %topic,
        concurrency,
        "starting stage workers"
    );

    (0..concurrency)
        .map(|slot| {
            let ctx = ctx.clone();
            let worker = worker.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let received = tokio::select! {
                        received = ctx.bus.receive(
                            topic,
                            Duration::from_millis(500),
                        ) => received,
                        _ = shutdown.changed() => continue,
                    };
                    match received {
                        Ok(Some(delivery)) => {
                            handle_delivery(&ctx, worker.as_ref(), delivery)
                                .await;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            error!(
                                target: "worker::substrate",
                                topic = %topic,
                                slot,
                                error = %err,
                                "receive failed; backing off"
                            );
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                debug!(
                    target: "worker::substrate",
                    topic = %topic,
                    slot,
                    "stage worker stopped"
                );
            })
        })
        .collect()
}

async fn handle_delivery(
    ctx: &WorkerContext,
    worker: &dyn StageWorker,
    delivery: Delivery,
) {
    let envelope = delivery.envelope;
    let tag = delivery.tag;

    let job = match ctx.ledger.job(envelope.job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            warn!(
                target: "worker::substrate",
                message = %envelope.message_id,
                job = %envelope.job_id,
                "message for unknown job; dropping"
            );
            let _ = ctx.bus.ack(&tag).await;
            return;
        }
        Err(err) => {
            error!(
                target: "worker::substrate",
                error = %err,
                "ledger unavailable; requeueing delivery"
            );
            let _ = ctx.bus.nack(&tag, true, Some(err.to_string())).await;
            return;
        }
    };

    // Cancelled (or otherwise finished) jobs drain without side effects.
    if job.is_terminal() {
        let _ = ctx.bus.ack(&tag).await;
        return;
    }

    if let Err(err) = ctx.ledger.mark_running(job.id).await {
        let _ = ctx.bus.nack(&tag, true, Some(err.to_string())).await;
        return;
    }

    let timeout = Duration::from_millis(job.timeout_ms.max(1));
    let outcome =
        tokio::time::timeout(timeout, worker.process(ctx, &envelope)).await;

    match outcome {
        Ok(Ok(())) => {
            let _ = ctx.bus.ack(&tag).await;
        }
        Err(_elapsed) => {
            warn!(
                target: "worker::substrate",
                job = %job.id,
                timeout_ms = job.timeout_ms,
                "stage timed out"
            );
            worker
                .settle_failure(ctx, &envelope, ItemOutcome::Failed, "timeout")
                .await;
            let _ = ctx
                .bus
                .nack(&tag, false, Some("timeout".to_string()))
                .await;
        }
        Ok(Err(err)) => match err.retryability() {
            Retryability::Retryable
                if envelope.attempt < ctx.config.retry.max_attempts =>
            {
                debug!(
                    target: "worker::substrate",
                    job = %job.id,
                    attempt = envelope.attempt,
                    error = %err,
                    "retryable failure; requeueing"
                );
                let _ = ctx.bus.nack(&tag, true, Some(err.to_string())).await;
            }
            Retryability::Retryable => {
                warn!(
                    target: "worker::substrate",
                    job = %job.id,
                    error = %err,
                    "retry budget spent; dead-lettering"
                );
                worker
                    .settle_failure(
                        ctx,
                        &envelope,
                        err.exhausted_outcome(),
                        &err.to_string(),
                    )
                    .await;
                let _ = ctx.bus.nack(&tag, true, Some(err.to_string())).await;
            }
            Retryability::Fatal => {
                warn!(
                    target: "worker::substrate",
                    job = %job.id,
                    error = %err,
                    "non-retryable failure"
                );
                worker
                    .settle_failure(
                        ctx,
                        &envelope,
                        ItemOutcome::Failed,
                        &err.to_string(),
                    )
                    .await;
                let _ = ctx.bus.ack(&tag).await;
            }
        },
    }
}
