//! Bulk maintenance operations: derivative regeneration and eviction.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};
use vitrine_model::collection::{Collection, MediaItem, SourceLocator};
use vitrine_model::job::{ItemOutcome, JobKind, JobRecord, JobStatus};
use vitrine_model::message::{
    BulkOperation, MessageEnvelope, StagePayload, Topic,
};
use vitrine_model::preset::DerivativePreset;

use super::{StageWorker, WorkerContext};
use crate::error::{CatalogError, Result};
use crate::store::{ProcessingStage, ProcessingState, StageState};

fn source_for(collection: &Collection, item: &MediaItem) -> SourceLocator {
    if collection.kind.is_archive() {
        SourceLocator::ArchiveEntry {
            archive_path: collection.path.clone(),
            entry_name: item.relative_path.clone(),
        }
    } else {
        let mut path = collection.path.clone();
        for segment in item.relative_path.split('/') {
            path.push(segment);
        }
        SourceLocator::Path { path }
    }
}

#[derive(Debug, Default)]
pub struct BulkWorker;

impl BulkWorker {
    pub fn new() -> Self {
        Self
    }

    async fn regenerate(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
        collection: &Collection,
        stage: ProcessingStage,
    ) -> Result<()> {
        let library = ctx
            .catalog
            .libraries
            .library(collection.library_id)
            .await?
            .ok_or_else(|| {
                CatalogError::NotFound(format!(
                    "library {}",
                    collection.library_id
                ))
            })?;
        let preset = match stage {
            ProcessingStage::Thumbnail => {
                library.settings.thumbnail_preset.clone()
            }
            ProcessingStage::Cache => library.settings.cache_preset.clone(),
            ProcessingStage::Metadata => DerivativePreset::thumbnail_default(),
        };

        if collection.media_items.is_empty() {
            return ctx
                .finish_job(envelope.job_id, JobStatus::Completed, None)
                .await;
        }

        // Account everything before publishing anything.
        for item in &collection.media_items {
            let mut state = ProcessingState::new(
                collection.id,
                item.id,
                Some(envelope.job_id),
            );
            state.set_stage(stage, StageState::Pending);
            ctx.catalog.processing.put_processing_state(&state).await?;
            ctx.ledger.add_total(envelope.job_id, 1).await?;
        }

        for item in &collection.media_items {
            let source = source_for(collection, item);
            let (kind, payload) = match stage {
                ProcessingStage::Thumbnail => (
                    JobKind::Thumbnail,
                    StagePayload::ThumbnailGenerate {
                        collection_id: collection.id,
                        media_item_id: item.id,
                        source,
                        preset: preset.clone(),
                    },
                ),
                ProcessingStage::Cache => (
                    JobKind::Cache,
                    StagePayload::CacheGenerate {
                        collection_id: collection.id,
                        media_item_id: item.id,
                        source,
                        preset: preset.clone(),
                    },
                ),
                ProcessingStage::Metadata => (
                    JobKind::Metadata,
                    StagePayload::ImageProcess {
                        collection_id: collection.id,
                        media_item_id: item.id,
                        source,
                    },
                ),
            };
            let mut job = JobRecord::new(
                kind,
                envelope.correlation_id,
                ctx.config.workers.job_timeout_ms,
            )
            .with_parent(envelope.job_id)
            .with_parameter(
                "collection_id",
                Value::String(collection.id.to_string()),
            )
            .with_parameter(
                "media_item_id",
                Value::String(item.id.to_string()),
            );
            job.progress.total = 1;
            ctx.ledger.create_job(&job).await?;
            ctx.bus
                .publish(
                    MessageEnvelope::new(
                        envelope.correlation_id,
                        job.id,
                        payload,
                    )
                    .with_parent(envelope.job_id)
                    .with_scan_job(envelope.job_id),
                )
                .await?;
        }

        info!(
            target: "worker::bulk",
            collection = %collection.id,
            items = collection.media_items.len(),
            stage = ?stage,
            "bulk regeneration fanned out"
        );
        Ok(())
    }

    async fn evict(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
        collection: &Collection,
    ) -> Result<()> {
        let stale = ctx
            .mutate_collection(collection.id, |fresh| {
                let stale: Vec<_> = fresh
                    .thumbnails
                    .iter()
                    .chain(fresh.cache_images.iter())
                    .filter(|r| !r.is_direct)
                    .cloned()
                    .collect();
                fresh.thumbnails.clear();
                fresh.cache_images.clear();
                fresh.refresh_derivative_counts();
                Ok(stale)
            })
            .await?;

        let total = stale.len();
        for derivative in stale {
            if let Err(err) = ctx
                .allocator
                .evict_file(&derivative.path, derivative.byte_size)
                .await
            {
                warn!(
                    target: "worker::bulk",
                    path = %derivative.path.display(),
                    error = %err,
                    "derivative eviction failed"
                );
            }
        }
        ctx.catalog
            .processing
            .clear_collection_states(collection.id)
            .await?;

        info!(
            target: "worker::bulk",
            collection = %collection.id,
            evicted = total,
            "derivatives evicted"
        );
        ctx.finish_job(envelope.job_id, JobStatus::Completed, None).await
    }
}

#[async_trait]
impl StageWorker for BulkWorker {
    fn topic(&self) -> Topic {
        Topic::BulkOperation
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
    ) -> Result<()> {
        let StagePayload::BulkOperation { operation } = &envelope.payload
        else {
            return Err(CatalogError::Internal(
                "bulk worker received foreign payload".to_string(),
            ));
        };

        let Some(collection) = ctx
            .catalog
            .collections
            .collection(operation.collection_id())
            .await?
        else {
            return ctx
                .finish_job(envelope.job_id, JobStatus::Completed, None)
                .await;
        };

        match operation {
            BulkOperation::RegenerateThumbnails { .. } => {
                self.regenerate(
                    ctx,
                    envelope,
                    &collection,
                    ProcessingStage::Thumbnail,
                )
                .await
            }
            BulkOperation::RegenerateCache { .. } => {
                self.regenerate(
                    ctx,
                    envelope,
                    &collection,
                    ProcessingStage::Cache,
                )
                .await
            }
            BulkOperation::EvictDerivatives { .. } => {
                self.evict(ctx, envelope, &collection).await
            }
        }
    }

    async fn settle_failure(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
        _outcome: ItemOutcome,
        error: &str,
    ) {
        if let Err(err) = ctx
            .finish_job(
                envelope.job_id,
                JobStatus::Failed,
                Some(error.to_string()),
            )
            .await
        {
            warn!(
                target: "worker::bulk",
                job = %envelope.job_id,
                error = %err,
                "failed to settle bulk failure"
            );
        }
    }
}
