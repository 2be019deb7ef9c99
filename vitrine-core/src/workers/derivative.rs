//! Stage 3: produce one thumbnail or cache image for one media item.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};
use vitrine_model::collection::{MediaItem, MediaKind, SourceLocator};
use vitrine_model::ids::{CollectionId, JobId, MediaItemId};
use vitrine_model::job::{ItemOutcome, JobStatus};
use vitrine_model::message::{MessageEnvelope, StagePayload, Topic};
use vitrine_model::preset::{DerivativeKind, DerivativePreset};

use super::{StageWorker, WorkerContext};
use crate::codec::EncodedImage;
use crate::error::{CatalogError, Result};
use crate::ledger::settled_status;
use crate::store::{ProcessingStage, StageState};

pub struct DerivativeWorker {
    kind: DerivativeKind,
}

impl std::fmt::Debug for DerivativeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivativeWorker")
            .field("kind", &self.kind)
            .finish()
    }
}

impl DerivativeWorker {
    pub fn thumbnails() -> Self {
        Self {
            kind: DerivativeKind::Thumbnail,
        }
    }

    pub fn cache_images() -> Self {
        Self {
            kind: DerivativeKind::Cache,
        }
    }

    fn stage(&self) -> ProcessingStage {
        match self.kind {
            DerivativeKind::Thumbnail => ProcessingStage::Thumbnail,
            DerivativeKind::Cache => ProcessingStage::Cache,
        }
    }

    fn payload_fields<'a>(
        &self,
        envelope: &'a MessageEnvelope,
    ) -> Result<(
        CollectionId,
        MediaItemId,
        &'a SourceLocator,
        &'a DerivativePreset,
    )> {
        match (&envelope.payload, self.kind) {
            (
                StagePayload::ThumbnailGenerate {
                    collection_id,
                    media_item_id,
                    source,
                    preset,
                },
                DerivativeKind::Thumbnail,
            )
            | (
                StagePayload::CacheGenerate {
                    collection_id,
                    media_item_id,
                    source,
                    preset,
                },
                DerivativeKind::Cache,
            ) => Ok((*collection_id, *media_item_id, source, preset)),
            _ => Err(CatalogError::Internal(format!(
                "{:?} derivative worker received foreign payload",
                self.kind
            ))),
        }
    }

    /// Render the derivative, or `None` when the item must be skipped
    /// (video sources without frame extraction available).
    async fn render(
        &self,
        ctx: &WorkerContext,
        item: &MediaItem,
        source: &SourceLocator,
        preset: &DerivativePreset,
    ) -> Result<Option<EncodedImage>> {
        match item.kind {
            MediaKind::Image => {
                let bytes = ctx.source_bytes(source).await?;
                let rendered =
                    ctx.engine.render(&bytes, preset, &source.describe())?;
                Ok(Some(rendered))
            }
            MediaKind::Video => self.render_video_frame(ctx, source, preset).await,
        }
    }

    #[cfg(feature = "ffmpeg")]
    async fn render_video_frame(
        &self,
        ctx: &WorkerContext,
        source: &SourceLocator,
        preset: &DerivativePreset,
    ) -> Result<Option<EncodedImage>> {
        // Frame extraction needs a seekable file; archived videos skip.
        let SourceLocator::Path { path } = source else {
            return Ok(None);
        };
        let codec = *ctx.engine.codec();
        let path = path.clone();
        let decoded = tokio::task::spawn_blocking(move || {
            codec.decode_video_frame(&path)
        })
        .await
        .map_err(|err| CatalogError::Internal(format!("decode task: {err}")))??;
        Ok(Some(ctx.engine.render_decoded(&decoded, preset)?))
    }

    #[cfg(not(feature = "ffmpeg"))]
    async fn render_video_frame(
        &self,
        _ctx: &WorkerContext,
        source: &SourceLocator,
        _preset: &DerivativePreset,
    ) -> Result<Option<EncodedImage>> {
        debug!(
            target: "worker::derivative",
            source = %source.describe(),
            "video frame extraction unavailable; skipping derivative"
        );
        Ok(None)
    }

    /// Record the single item of this per-item job and finish it.
    async fn complete_own_job(
        &self,
        ctx: &WorkerContext,
        job_id: JobId,
        outcome: ItemOutcome,
    ) -> Result<()> {
        let job = ctx.ledger.record_item(job_id, outcome, None).await?;
        if job.is_terminal() {
            return Ok(());
        }
        ctx.ledger
            .finish(job_id, settled_status(&job), None)
            .await
    }

    async fn attach_preview(
        &self,
        ctx: &WorkerContext,
        collection_id: CollectionId,
        rendered: &EncodedImage,
    ) -> Result<()> {
        let Some(mut entry) = ctx.index.entry(collection_id).await? else {
            return Ok(());
        };
        let preview = ctx
            .engine
            .render_preview(&rendered.bytes, "thumbnail preview")?;
        entry.thumbnail_preview = Some(preview);
        ctx.index.upsert_entry(&entry).await
    }
}

#[async_trait]
impl StageWorker for DerivativeWorker {
    fn topic(&self) -> Topic {
        match self.kind {
            DerivativeKind::Thumbnail => Topic::ThumbnailGenerate,
            DerivativeKind::Cache => Topic::CacheGenerate,
        }
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
    ) -> Result<()> {
        let (collection_id, media_item_id, source, preset) =
            self.payload_fields(envelope)?;

        let Some(collection) =
            ctx.catalog.collections.collection(collection_id).await?
        else {
            return self
                .complete_own_job(ctx, envelope.job_id, ItemOutcome::Skipped)
                .await;
        };
        let Some(item) = collection.media_item(media_item_id).cloned() else {
            // Rescan removed the item while the message was queued.
            return self
                .complete_own_job(ctx, envelope.job_id, ItemOutcome::Skipped)
                .await;
        };

        // Duplicate delivery: the stage already settled.
        let state = ctx
            .catalog
            .processing
            .processing_state(collection_id, media_item_id)
            .await?;
        if state
            .as_ref()
            .is_some_and(|s| s.stage(self.stage()) != StageState::Pending)
        {
            debug!(
                target: "worker::derivative",
                media_item = %media_item_id,
                stage = ?self.stage(),
                "stage already settled; acknowledging duplicate"
            );
            return self
                .complete_own_job(ctx, envelope.job_id, ItemOutcome::Completed)
                .await;
        }

        let Some(rendered) =
            self.render(ctx, &item, source, preset).await?
        else {
            ctx.settle_stage(
                collection_id,
                media_item_id,
                self.stage(),
                StageState::Skipped,
            )
            .await?;
            return self
                .complete_own_job(ctx, envelope.job_id, ItemOutcome::Skipped)
                .await;
        };

        let stored = ctx
            .allocator
            .store_derivative(
                collection_id,
                media_item_id,
                preset,
                &rendered.bytes,
            )
            .await?;

        let derivative = vitrine_model::collection::DerivativeRef {
            media_item_id,
            format: preset.extension().to_string(),
            width: rendered.width,
            height: rendered.height,
            path: stored.path,
            byte_size: stored.byte_size,
            generated_at: Utc::now(),
            is_direct: false,
        };
        let kind = self.kind;
        ctx.mutate_collection(collection_id, |fresh| {
            fresh.upsert_derivative(kind, derivative.clone());
            Ok(())
        })
        .await?;

        if self.kind == DerivativeKind::Thumbnail
            && item.insertion_order == 0
            && let Err(err) =
                self.attach_preview(ctx, collection_id, &rendered).await
        {
            warn!(
                target: "worker::derivative",
                collection = %collection_id,
                error = %err,
                "failed to attach index preview"
            );
        }

        ctx.settle_stage(
            collection_id,
            media_item_id,
            self.stage(),
            StageState::Completed,
        )
        .await?;
        self.complete_own_job(ctx, envelope.job_id, ItemOutcome::Completed)
            .await
    }

    async fn settle_failure(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
        outcome: ItemOutcome,
        error: &str,
    ) {
        let Ok((collection_id, media_item_id, ..)) =
            self.payload_fields(envelope)
        else {
            return;
        };
        let stage_state = match outcome {
            ItemOutcome::Skipped => StageState::Skipped,
            _ => StageState::Failed,
        };
        if let Err(err) = ctx
            .settle_stage(
                collection_id,
                media_item_id,
                self.stage(),
                stage_state,
            )
            .await
        {
            warn!(
                target: "worker::derivative",
                media_item = %media_item_id,
                error = %err,
                "failed to settle stage after failure"
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
                target: "worker::derivative",
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
                target: "worker::derivative",
                job = %envelope.job_id,
                error = %err,
                "failed to finish derivative job"
            );
        }
    }
}
