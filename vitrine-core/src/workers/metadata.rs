//! Metadata extraction stage: dimensions (and duration for videos) written
//! back onto the embedded media item.

use async_trait::async_trait;
use tracing::{debug, warn};
use vitrine_model::collection::{MediaKind, SourceLocator};
use vitrine_model::job::{ItemOutcome, JobStatus};
use vitrine_model::message::{MessageEnvelope, StagePayload, Topic};

use super::{StageWorker, WorkerContext};
use crate::error::{CatalogError, Result};
use crate::ledger::settled_status;
use crate::store::{ProcessingStage, StageState};

/// Extracted media properties.
#[derive(Debug, Clone, Copy, Default)]
struct MediaProperties {
    width: u32,
    height: u32,
    duration_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct MetadataWorker;

impl MetadataWorker {
    pub fn new() -> Self {
        Self
    }

    async fn extract_image(
        &self,
        ctx: &WorkerContext,
        source: &SourceLocator,
    ) -> Result<MediaProperties> {
        let bytes = ctx.source_bytes(source).await?;
        let decoded = ctx
            .engine
            .codec()
            .decode_image(&bytes, &source.describe())?;
        Ok(MediaProperties {
            width: decoded.width(),
            height: decoded.height(),
            duration_ms: None,
        })
    }

    #[cfg(feature = "ffmpeg")]
    async fn extract_video(
        &self,
        ctx: &WorkerContext,
        source: &SourceLocator,
    ) -> Result<Option<MediaProperties>> {
        let SourceLocator::Path { path } = source else {
            return Ok(None);
        };
        let codec = *ctx.engine.codec();
        let path = path.clone();
        let probe =
            tokio::task::spawn_blocking(move || codec.probe_video(&path))
                .await
                .map_err(|err| {
                    CatalogError::Internal(format!("probe task: {err}"))
                })??;
        Ok(Some(MediaProperties {
            width: probe.width,
            height: probe.height,
            duration_ms: probe.duration_ms,
        }))
    }

    #[cfg(not(feature = "ffmpeg"))]
    async fn extract_video(
        &self,
        _ctx: &WorkerContext,
        source: &SourceLocator,
    ) -> Result<Option<MediaProperties>> {
        debug!(
            target: "worker::metadata",
            source = %source.describe(),
            "video probing unavailable; leaving container metadata empty"
        );
        Ok(None)
    }

    async fn complete_own_job(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
        outcome: ItemOutcome,
    ) -> Result<()> {
        let job = ctx
            .ledger
            .record_item(envelope.job_id, outcome, None)
            .await?;
        if job.is_terminal() {
            return Ok(());
        }
        ctx.ledger
            .finish(envelope.job_id, settled_status(&job), None)
            .await
    }
}

#[async_trait]
impl StageWorker for MetadataWorker {
    fn topic(&self) -> Topic {
        Topic::ImageProcess
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
    ) -> Result<()> {
        let StagePayload::ImageProcess {
            collection_id,
            media_item_id,
            source,
        } = &envelope.payload
        else {
            return Err(CatalogError::Internal(
                "metadata worker received foreign payload".to_string(),
            ));
        };
        let (collection_id, media_item_id) = (*collection_id, *media_item_id);

        let Some(collection) =
            ctx.catalog.collections.collection(collection_id).await?
        else {
            return self
                .complete_own_job(ctx, envelope, ItemOutcome::Skipped)
                .await;
        };
        let Some(item) = collection.media_item(media_item_id).cloned() else {
            return self
                .complete_own_job(ctx, envelope, ItemOutcome::Skipped)
                .await;
        };

        let state = ctx
            .catalog
            .processing
            .processing_state(collection_id, media_item_id)
            .await?;
        if state.as_ref().is_some_and(|s| {
            s.stage(ProcessingStage::Metadata) != StageState::Pending
        }) {
            return self
                .complete_own_job(ctx, envelope, ItemOutcome::Completed)
                .await;
        }

        let properties = match item.kind {
            MediaKind::Image => Some(self.extract_image(ctx, source).await?),
            MediaKind::Video => self.extract_video(ctx, source).await?,
        };

        if let Some(properties) = properties {
            ctx.mutate_collection(collection_id, |fresh| {
                if let Some(stored) = fresh
                    .media_items
                    .iter_mut()
                    .find(|candidate| candidate.id == media_item_id)
                {
                    stored.width = properties.width;
                    stored.height = properties.height;
                    stored.duration_ms = properties.duration_ms;
                }
                // Direct references are the original file; keep their
                // dimensions in step with it.
                for derivative in fresh
                    .thumbnails
                    .iter_mut()
                    .chain(fresh.cache_images.iter_mut())
                {
                    if derivative.media_item_id == media_item_id
                        && derivative.is_direct
                    {
                        derivative.width = properties.width;
                        derivative.height = properties.height;
                    }
                }
                Ok(())
            })
            .await?;
        }

        ctx.settle_stage(
            collection_id,
            media_item_id,
            ProcessingStage::Metadata,
            StageState::Completed,
        )
        .await?;
        self.complete_own_job(ctx, envelope, ItemOutcome::Completed)
            .await
    }

    async fn settle_failure(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
        outcome: ItemOutcome,
        error: &str,
    ) {
        let StagePayload::ImageProcess {
            collection_id,
            media_item_id,
            ..
        } = &envelope.payload
        else {
            return;
        };
        let stage_state = match outcome {
            ItemOutcome::Skipped => StageState::Skipped,
            _ => StageState::Failed,
        };
        if let Err(err) = ctx
            .settle_stage(
                *collection_id,
                *media_item_id,
                ProcessingStage::Metadata,
                stage_state,
            )
            .await
        {
            warn!(
                target: "worker::metadata",
                media_item = %media_item_id,
                error = %err,
                "failed to settle metadata stage after failure"
            );
        }
        let status = match outcome {
            ItemOutcome::Failed => JobStatus::Failed,
            _ => JobStatus::Completed,
        };
        if let Err(err) =
            ctx.ledger.record_item(envelope.job_id, outcome, None).await
        {
            warn!(
                target: "worker::metadata",
                job = %envelope.job_id,
                error = %err,
                "failed to record item outcome"
            );
        }
        if let Err(err) = ctx
            .ledger
            .finish(envelope.job_id, status, Some(error.to_string()))
            .await
        {
            warn!(
                target: "worker::metadata",
                job = %envelope.job_id,
                error = %err,
                "failed to finish metadata job"
            );
        }
    }
}
