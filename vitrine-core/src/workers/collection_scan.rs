//! Stage 2: enumerate one collection, reconcile the embedded media list,
//! and fan out per-item derivative work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};
use vitrine_model::collection::{
    Collection, CollectionKind, DerivativeRef, MediaItem, MediaKind,
    OriginSignature, SourceLocator,
};
use vitrine_model::ids::JobId;
use vitrine_model::job::{ItemOutcome, JobKind, JobRecord, JobStatus};
use vitrine_model::library::Library;
use vitrine_model::message::{MessageEnvelope, StagePayload, Topic};
use vitrine_model::preset::{DerivativeKind, DerivativePreset};

use super::{StageWorker, WorkerContext};
use crate::error::{CatalogError, Result};
use crate::reconcile::{ScannedMedia, reconcile};
use crate::store::{ProcessingStage, ProcessingState, StageState};
use crate::walker::ScanFilter;

/// Map a `/`-separated relative path under the collection root.
fn absolute_media_path(collection_path: &Path, relative: &str) -> PathBuf {
    let mut path = collection_path.to_path_buf();
    for segment in relative.split('/') {
        path.push(segment);
    }
    path
}

fn source_for(collection: &Collection, item: &MediaItem) -> SourceLocator {
    if collection.kind.is_archive() {
        SourceLocator::ArchiveEntry {
            archive_path: collection.path.clone(),
            entry_name: item.relative_path.clone(),
        }
    } else {
        SourceLocator::Path {
            path: absolute_media_path(&collection.path, &item.relative_path),
        }
    }
}

fn direct_ref(item: &MediaItem, path: PathBuf) -> DerivativeRef {
    DerivativeRef {
        media_item_id: item.id,
        format: item.format.clone(),
        width: item.width,
        height: item.height,
        path,
        byte_size: item.byte_size,
        generated_at: Utc::now(),
        is_direct: true,
    }
}

#[derive(Debug, Default)]
pub struct CollectionScanWorker;

impl CollectionScanWorker {
    pub fn new() -> Self {
        Self
    }

    fn scan_filter(library: &Library, collection: &Collection) -> ScanFilter {
        let allowed_formats = if collection.settings.allowed_formats.is_empty()
        {
            library.settings.allowed_formats.iter().cloned().collect()
        } else {
            collection.settings.allowed_formats.clone()
        };
        ScanFilter {
            allowed_formats,
            excluded_paths: library
                .settings
                .excluded_paths
                .iter()
                .cloned()
                .collect(),
            max_file_size: library.settings.max_file_size,
        }
    }

    fn media_kind(library: &Library, format: &str) -> MediaKind {
        if library.settings.is_video_format(format) {
            MediaKind::Video
        } else {
            MediaKind::Image
        }
    }

    /// Enumerate the collection's media. `Ok(None)` means the container
    /// itself is gone and the collection should be tombstoned.
    async fn enumerate(
        &self,
        ctx: &WorkerContext,
        library: &Library,
        collection: &Collection,
    ) -> Result<Option<Vec<ScannedMedia>>> {
        if collection.kind == CollectionKind::Directory {
            let filter = Self::scan_filter(library, collection);
            let files = match ctx
                .walker
                .enumerate_media(&collection.path, &filter)
                .await
            {
                Ok(files) => files,
                Err(CatalogError::NotFound(_)) => return Ok(None),
                Err(err) => return Err(err),
            };
            return Ok(Some(
                files
                    .into_iter()
                    .map(|file| ScannedMedia {
                        kind: Self::media_kind(library, &file.format),
                        origin: file.metadata.signature(),
                        source: SourceLocator::Path {
                            path: file.absolute_path,
                        },
                        relative_path: file.relative_path,
                        filename: file.filename,
                        format: file.format,
                        byte_size: file.byte_size,
                    })
                    .collect(),
            ));
        }

        if !ctx.walker.fs().path_exists(&collection.path).await {
            return Ok(None);
        }
        let filter = Self::scan_filter(library, collection);
        let entries = ctx
            .archives
            .list_entries(&collection.path, collection.kind)
            .await?;
        Ok(Some(
            entries
                .into_iter()
                .filter_map(|entry| {
                    let format = entry
                        .name
                        .rsplit('.')
                        .next()
                        .map(|ext| ext.to_ascii_lowercase())?;
                    if !filter.allowed_formats.contains(&format) {
                        return None;
                    }
                    let filename = entry
                        .name
                        .rsplit('/')
                        .next()
                        .unwrap_or(&entry.name)
                        .to_string();
                    Some(ScannedMedia {
                        kind: Self::media_kind(library, &format),
                        origin: OriginSignature::ArchiveEntry {
                            uncompressed_size: entry.uncompressed_size,
                        },
                        source: SourceLocator::ArchiveEntry {
                            archive_path: collection.path.clone(),
                            entry_name: entry.name.clone(),
                        },
                        relative_path: entry.name,
                        filename,
                        format,
                        byte_size: entry.uncompressed_size,
                    })
                })
                .collect(),
        ))
    }

    async fn tombstone(
        &self,
        ctx: &WorkerContext,
        collection_id: vitrine_model::ids::CollectionId,
        scan_job_id: JobId,
    ) -> Result<()> {
        info!(
            target: "worker::collection_scan",
            collection = %collection_id,
            "collection root gone; tombstoning"
        );
        ctx.mutate_collection(collection_id, |collection| {
            collection.deleted = true;
            Ok(())
        })
        .await?;
        ctx.catalog
            .processing
            .clear_collection_states(collection_id)
            .await?;
        ctx.finish_job(scan_job_id, JobStatus::Completed, None).await
    }

    /// Hold per-item fan-out while either derivative queue is saturated.
    async fn wait_for_derivative_capacity(
        &self,
        ctx: &WorkerContext,
    ) -> Result<()> {
        let high = ctx.config.workers.fanout_high_watermark;
        let low = ctx.config.workers.fanout_low_watermark;
        loop {
            let thumb = ctx.bus.depth(Topic::ThumbnailGenerate).await?;
            let cache = ctx.bus.depth(Topic::CacheGenerate).await?;
            if thumb.max(cache) < high {
                return Ok(());
            }
            debug!(
                target: "worker::collection_scan",
                thumb, cache,
                "derivative queues saturated; pausing fan-out"
            );
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let thumb = ctx.bus.depth(Topic::ThumbnailGenerate).await?;
                let cache = ctx.bus.depth(Topic::CacheGenerate).await?;
                if thumb.max(cache) <= low {
                    break;
                }
            }
        }
    }

    /// Re-emit messages for every stage still pending under this scan job.
    async fn republish_pending(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
        collection: &Collection,
        library: &Library,
    ) -> Result<()> {
        let states = ctx
            .catalog
            .processing
            .collection_states(collection.id)
            .await?;
        for state in states {
            if state.scan_job_id != Some(envelope.job_id) {
                continue;
            }
            let Some(item) = collection.media_item(state.media_item_id)
            else {
                continue;
            };
            let source = source_for(collection, item);
            for (stage, preset) in [
                (
                    ProcessingStage::Thumbnail,
                    Some(&library.settings.thumbnail_preset),
                ),
                (
                    ProcessingStage::Cache,
                    Some(&library.settings.cache_preset),
                ),
                (ProcessingStage::Metadata, None),
            ] {
                if state.stage(stage) != StageState::Pending {
                    continue;
                }
                warn!(
                    target: "worker::collection_scan",
                    collection = %collection.id,
                    media_item = %item.id,
                    stage = ?stage,
                    "re-publishing stage left pending by an earlier delivery"
                );
                self.publish_stage(
                    ctx, envelope, collection, item, &source, stage, preset,
                )
                .await?;
            }
        }
        Ok(())
    }

    fn stage_job(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
        kind: JobKind,
        collection: &Collection,
        item: &MediaItem,
    ) -> JobRecord {
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
        .with_parameter("media_item_id", Value::String(item.id.to_string()));
        job.progress.total = 1;
        job
    }

    async fn publish_stage(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
        collection: &Collection,
        item: &MediaItem,
        source: &SourceLocator,
        stage: ProcessingStage,
        preset: Option<&DerivativePreset>,
    ) -> Result<()> {
        let (kind, payload) = match stage {
            ProcessingStage::Thumbnail => (
                JobKind::Thumbnail,
                StagePayload::ThumbnailGenerate {
                    collection_id: collection.id,
                    media_item_id: item.id,
                    source: source.clone(),
                    preset: preset
                        .cloned()
                        .unwrap_or_else(DerivativePreset::thumbnail_default),
                },
            ),
            ProcessingStage::Cache => (
                JobKind::Cache,
                StagePayload::CacheGenerate {
                    collection_id: collection.id,
                    media_item_id: item.id,
                    source: source.clone(),
                    preset: preset
                        .cloned()
                        .unwrap_or_else(DerivativePreset::cache_default),
                },
            ),
            ProcessingStage::Metadata => (
                JobKind::Metadata,
                StagePayload::ImageProcess {
                    collection_id: collection.id,
                    media_item_id: item.id,
                    source: source.clone(),
                },
            ),
        };

        let job = self.stage_job(ctx, envelope, kind, collection, item);
        ctx.ledger.create_job(&job).await?;
        ctx.bus
            .publish(
                MessageEnvelope::new(envelope.correlation_id, job.id, payload)
                    .with_parent(envelope.job_id)
                    .with_scan_job(envelope.job_id),
            )
            .await
    }
}

#[async_trait]
impl StageWorker for CollectionScanWorker {
    fn topic(&self) -> Topic {
        Topic::CollectionScan
    }

    async fn process(
        &self,
        ctx: &WorkerContext,
        envelope: &MessageEnvelope,
    ) -> Result<()> {
        let StagePayload::CollectionScan {
            collection_id,
            force,
            use_direct_file_access,
        } = &envelope.payload
        else {
            return Err(CatalogError::Internal(
                "collection scan worker received foreign payload".to_string(),
            ));
        };
        let collection_id = *collection_id;

        let Some(collection) =
            ctx.catalog.collections.collection(collection_id).await?
        else {
            // Deleted since enqueue; nothing to scan.
            return ctx
                .finish_job(envelope.job_id, JobStatus::Completed, None)
                .await;
        };
        if collection.deleted {
            return ctx
                .finish_job(envelope.job_id, JobStatus::Completed, None)
                .await;
        }
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

        let Some(scanned) =
            self.enumerate(ctx, &library, &collection).await?
        else {
            return self.tombstone(ctx, collection_id, envelope.job_id).await;
        };

        let plan = reconcile(&collection.media_items, scanned);
        let mut to_process = plan.to_process;
        if *force {
            for item in &plan.items {
                let queued = to_process
                    .iter()
                    .any(|(existing, _)| existing.id == item.id);
                if !queued {
                    to_process.push((
                        item.clone(),
                        source_for(&collection, item),
                    ));
                }
            }
        }

        let direct = use_direct_file_access
            .unwrap_or(collection.settings.use_direct_file_access)
            && collection.kind == CollectionKind::Directory;

        if !plan.dirty && to_process.is_empty() {
            // Idempotent rescan: zero messages, no document mutation. Leave
            // the job open when earlier-fanned items are still settling.
            let job =
                ctx.ledger.job(envelope.job_id).await?.ok_or_else(|| {
                    CatalogError::NotFound(format!("job {}", envelope.job_id))
                })?;
            if job.progress.pending() == 0 {
                ctx.finish_job(envelope.job_id, JobStatus::Completed, None)
                    .await?;
            } else {
                // Redelivery after an interrupted fan-out: re-publish the
                // stages that never settled. Duplicates are harmless; stage
                // workers check for settled stages first.
                self.republish_pending(ctx, envelope, &collection, &library)
                    .await?;
            }
            return Ok(());
        }

        let container_signature = ctx
            .walker
            .fs()
            .metadata(&collection.path)
            .await
            .ok()
            .map(|meta| meta.signature());

        // Single atomic write-back: media list, counters, signature.
        let items = plan.items;
        let removed = plan.removed;
        let evictions = ctx
            .mutate_collection(collection_id, |fresh| {
                fresh.media_items = items.clone();
                let mut evict: Vec<DerivativeRef> = Vec::new();
                for gone in &removed {
                    evict.extend(
                        fresh
                            .thumbnails
                            .iter()
                            .chain(fresh.cache_images.iter())
                            .filter(|r| {
                                r.media_item_id == gone.id && !r.is_direct
                            })
                            .cloned(),
                    );
                }
                if direct {
                    for (item, _) in &to_process {
                        let path = absolute_media_path(
                            &fresh.path,
                            &item.relative_path,
                        );
                        fresh.upsert_derivative(
                            DerivativeKind::Thumbnail,
                            direct_ref(item, path.clone()),
                        );
                        fresh.upsert_derivative(
                            DerivativeKind::Cache,
                            direct_ref(item, path),
                        );
                    }
                }
                fresh.refresh_derivative_counts();
                fresh.container_signature = container_signature.clone();
                fresh.statistics.last_scan_at = Some(Utc::now());
                Ok(evict)
            })
            .await?;

        for stale in &evictions {
            if let Err(err) =
                ctx.allocator.evict_file(&stale.path, stale.byte_size).await
            {
                warn!(
                    target: "worker::collection_scan",
                    path = %stale.path.display(),
                    error = %err,
                    "derivative eviction failed"
                );
            }
        }

        if to_process.is_empty() {
            let job =
                ctx.ledger.job(envelope.job_id).await?.ok_or_else(|| {
                    CatalogError::NotFound(format!("job {}", envelope.job_id))
                })?;
            if job.progress.pending() == 0 {
                ctx.finish_job(envelope.job_id, JobStatus::Completed, None)
                    .await?;
            }
            return Ok(());
        }

        // Phase one: account every item before any message exists, so a
        // fast consumer cannot settle the job while fan-out is underway.
        // Direct access replaced the derivative messages with synchronous
        // references above, but metadata extraction still runs per item.
        let mut fresh_items = Vec::with_capacity(to_process.len());
        for (item, source) in &to_process {
            let existing = ctx
                .catalog
                .processing
                .processing_state(collection_id, item.id)
                .await?;
            let already_counted = existing
                .as_ref()
                .is_some_and(|s| s.scan_job_id == Some(envelope.job_id));
            if !already_counted {
                let mut state = ProcessingState::new(
                    collection_id,
                    item.id,
                    Some(envelope.job_id),
                );
                if !direct && collection.settings.generate_thumbnails {
                    state.thumbnail = StageState::Pending;
                }
                if !direct && collection.settings.generate_cache {
                    state.cache = StageState::Pending;
                }
                state.metadata = StageState::Pending;
                ctx.catalog.processing.put_processing_state(&state).await?;
                ctx.ledger.add_total(envelope.job_id, 1).await?;
                fresh_items.push((item.clone(), source.clone(), state));
            } else if let Some(state) = existing {
                // Redelivery: republish only the stages still pending.
                fresh_items.push((item.clone(), source.clone(), state));
            }
        }

        // Phase two: fan out.
        let mut published = 0usize;
        for (item, source, state) in &fresh_items {
            self.wait_for_derivative_capacity(ctx).await?;
            for (stage, preset) in [
                (
                    ProcessingStage::Thumbnail,
                    Some(&library.settings.thumbnail_preset),
                ),
                (
                    ProcessingStage::Cache,
                    Some(&library.settings.cache_preset),
                ),
                (ProcessingStage::Metadata, None),
            ] {
                if state.stage(stage) != StageState::Pending {
                    continue;
                }
                self.publish_stage(
                    ctx, envelope, &collection, item, source, stage, preset,
                )
                .await?;
                published += 1;
            }
        }

        info!(
            target: "worker::collection_scan",
            collection = %collection_id,
            items = fresh_items.len(),
            messages = published,
            removed = removed.len(),
            "collection scan fanned out"
        );
        Ok(())
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
                target: "worker::collection_scan",
                job = %envelope.job_id,
                error = %err,
                "failed to settle collection scan failure"
            );
        }
    }
}
