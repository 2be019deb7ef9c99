//! The scan coordinator: turns library-scan requests into collection
//! materialization and a tree of collection-scan jobs, and keeps the
//! parent/child progress aggregation honest.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vitrine_model::collection::Collection;
use vitrine_model::ids::{CollectionId, JobId, LibraryId};
use vitrine_model::index::IndexEntry;
use vitrine_model::job::{ItemOutcome, JobKind, JobRecord, JobStatus};
use vitrine_model::library::Library;
use vitrine_model::message::{MessageEnvelope, StagePayload, Topic};

use crate::bus::MessageBus;
use crate::config::PipelineConfig;
use crate::error::{CatalogError, Result};
use crate::index::CollectionIndex;
use crate::ledger::JobLedger;
use crate::store::CatalogStore;
use crate::walker::{CandidateCollection, FileSystem, Walker};

/// Shared handle: cheap to clone into workers and the scheduler.
#[derive(Clone)]
pub struct ScanCoordinator {
    catalog: CatalogStore,
    ledger: Arc<dyn JobLedger>,
    bus: Arc<dyn MessageBus>,
    index: Arc<dyn CollectionIndex>,
    walker: Arc<Walker<Arc<dyn FileSystem>>>,
    config: Arc<PipelineConfig>,
}

impl std::fmt::Debug for ScanCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanCoordinator").finish_non_exhaustive()
    }
}

impl ScanCoordinator {
    pub fn new(
        catalog: CatalogStore,
        ledger: Arc<dyn JobLedger>,
        bus: Arc<dyn MessageBus>,
        index: Arc<dyn CollectionIndex>,
        fs: Arc<dyn FileSystem>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            catalog,
            ledger,
            bus,
            index,
            walker: Arc::new(Walker::new(fs)),
            config,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.ledger
    }

    /// Accept a library-scan request. Coalesces into an existing
    /// non-terminal scan of the same library instead of starting a second
    /// one.
    pub async fn begin_library_scan(
        &self,
        library_id: LibraryId,
        force: bool,
    ) -> Result<JobId> {
        let library = self
            .catalog
            .libraries
            .library(library_id)
            .await?
            .ok_or_else(|| {
                CatalogError::Validation(format!("unknown library {library_id}"))
            })?;
        if !library.active {
            return Err(CatalogError::Validation(format!(
                "library {library_id} is inactive"
            )));
        }

        if let Some(running) = self
            .ledger
            .find_active(JobKind::LibraryScan, Some(library_id), None)
            .await?
        {
            info!(
                target: "scan::coordinator",
                library = %library_id,
                job = %running.id,
                "library scan already in flight; coalescing"
            );
            return Ok(running.id);
        }

        let job = JobRecord::new(
            JobKind::LibraryScan,
            Uuid::now_v7(),
            self.config.workers.job_timeout_ms,
        )
        .with_parameter("library_id", Value::String(library_id.to_string()))
        .with_parameter("force", Value::Bool(force));
        self.ledger.create_job(&job).await?;

        self.bus
            .publish(MessageEnvelope::new(
                job.correlation_id,
                job.id,
                StagePayload::LibraryScan { library_id, force },
            ))
            .await?;
        Ok(job.id)
    }

    /// Accept a single-collection scan request.
    pub async fn begin_collection_scan(
        &self,
        collection_id: CollectionId,
        force: bool,
        use_direct_file_access: Option<bool>,
    ) -> Result<JobId> {
        let collection = self
            .catalog
            .collections
            .collection(collection_id)
            .await?
            .ok_or_else(|| {
                CatalogError::Validation(format!(
                    "unknown collection {collection_id}"
                ))
            })?;

        if let Some(running) = self
            .ledger
            .find_active(JobKind::CollectionScan, None, Some(collection_id))
            .await?
        {
            return Ok(running.id);
        }

        let job = self.new_collection_scan_job(
            &collection,
            Uuid::now_v7(),
            None,
            force,
        );
        self.ledger.create_job(&job).await?;
        self.bus
            .publish(MessageEnvelope::new(
                job.correlation_id,
                job.id,
                StagePayload::CollectionScan {
                    collection_id,
                    force,
                    use_direct_file_access,
                },
            ))
            .await?;
        Ok(job.id)
    }

    fn new_collection_scan_job(
        &self,
        collection: &Collection,
        correlation_id: Uuid,
        parent: Option<JobId>,
        force: bool,
    ) -> JobRecord {
        let mut job = JobRecord::new(
            JobKind::CollectionScan,
            correlation_id,
            self.config.workers.job_timeout_ms,
        )
        .with_parameter(
            "collection_id",
            Value::String(collection.id.to_string()),
        )
        .with_parameter(
            "library_id",
            Value::String(collection.library_id.to_string()),
        )
        .with_parameter("force", Value::Bool(force));
        if let Some(parent) = parent {
            job = job.with_parent(parent);
        }
        job
    }

    /// Stage 1: walk the library root one level, materialize collections,
    /// and fan out child collection scans. Runs inside the library-scan
    /// worker under the parent job.
    pub async fn execute_library_scan(
        &self,
        job: &JobRecord,
        library_id: LibraryId,
        force: bool,
    ) -> Result<()> {
        let mut library = self
            .catalog
            .libraries
            .library(library_id)
            .await?
            .ok_or_else(|| {
                CatalogError::NotFound(format!("library {library_id}"))
            })?;

        // A missing or unreadable root fails the whole scan.
        let candidates =
            self.walker.discover_collections(&library.root_path).await?;
        debug!(
            target: "scan::coordinator",
            library = %library_id,
            candidates = candidates.len(),
            "library discovery finished"
        );

        let mut enqueued = 0u64;
        for candidate in candidates {
            self.wait_for_fanout_capacity(Topic::CollectionScan, job.id)
                .await?;
            match self
                .process_candidate(job, &library, &candidate, force)
                .await
            {
                Ok(true) => enqueued += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(
                        target: "scan::coordinator",
                        library = %library_id,
                        path = %candidate.path.display(),
                        error = %err,
                        "collection candidate failed"
                    );
                    self.ledger.add_total(job.id, 1).await?;
                    self.ledger
                        .record_item(
                            job.id,
                            ItemOutcome::Failed,
                            Some(candidate.path.display().to_string()),
                        )
                        .await?;
                }
            }
        }

        let collections = self
            .catalog
            .collections
            .collections_in_library(library_id)
            .await?;
        let active: Vec<_> =
            collections.iter().filter(|c| !c.deleted).collect();
        library.statistics.collection_count = active.len() as u64;
        library.statistics.media_count =
            active.iter().map(|c| c.statistics.media_count).sum();
        library.statistics.total_bytes =
            active.iter().map(|c| c.statistics.total_bytes).sum();
        library.statistics.last_scan_at = Some(chrono::Utc::now());
        self.catalog.libraries.update_library(&library).await?;

        // With nothing to scan the parent settles here; otherwise the last
        // finishing child completes it.
        let snapshot = self.ledger.job(job.id).await?.ok_or_else(|| {
            CatalogError::NotFound(format!("job {}", job.id))
        })?;
        if enqueued == 0 && snapshot.progress.pending() == 0 {
            self.ledger
                .finish(job.id, crate::ledger::settled_status(&snapshot), None)
                .await?;
        }
        Ok(())
    }

    /// Returns true when a child collection scan was enqueued.
    async fn process_candidate(
        &self,
        parent: &JobRecord,
        library: &Library,
        candidate: &CandidateCollection,
        force: bool,
    ) -> Result<bool> {
        let existing = self
            .catalog
            .collections
            .collection_by_path(&candidate.path)
            .await?;

        let collection = match existing {
            Some(found) if found.library_id != library.id => {
                // Same path cannot belong to two libraries.
                return Err(CatalogError::Validation(format!(
                    "path {} already belongs to library {}",
                    candidate.path.display(),
                    found.library_id
                )));
            }
            Some(found) => {
                let unchanged = found.container_signature.as_ref()
                    == Some(&candidate.signature)
                    && found.statistics.last_scan_at.is_some();
                if unchanged && !force {
                    return Ok(false);
                }
                found
            }
            None => {
                let collection = Collection::new(
                    library.id,
                    candidate.display_name.clone(),
                    candidate.path.clone(),
                    candidate.kind,
                );
                self.catalog
                    .collections
                    .insert_collection(&collection)
                    .await?;
                self.index
                    .upsert_entry(&IndexEntry::from_collection(
                        &collection,
                        None,
                    ))
                    .await?;
                collection
            }
        };

        let child = self.new_collection_scan_job(
            &collection,
            parent.correlation_id,
            Some(parent.id),
            force,
        );
        self.ledger.create_job(&child).await?;
        self.ledger.add_total(parent.id, 1).await?;
        self.bus
            .publish(
                MessageEnvelope::new(
                    parent.correlation_id,
                    child.id,
                    StagePayload::CollectionScan {
                        collection_id: collection.id,
                        force,
                        use_direct_file_access: None,
                    },
                )
                .with_parent(parent.id),
            )
            .await?;
        Ok(true)
    }

    /// Backpressure: hold fan-out while the target queue is above the high
    /// watermark, resuming once it drains below the low watermark. Aborts
    /// if the owning job is cancelled while waiting.
    pub async fn wait_for_fanout_capacity(
        &self,
        topic: Topic,
        job_id: JobId,
    ) -> Result<()> {
        let high = self.config.workers.fanout_high_watermark;
        let low = self.config.workers.fanout_low_watermark;
        if self.bus.depth(topic).await? < high {
            return Ok(());
        }

        info!(
            target: "scan::coordinator",
            topic = %topic,
            "queue above high watermark; pausing fan-out"
        );
        loop {
            tokio::time::sleep(Duration::from_millis(200)).await;
            if let Some(job) = self.ledger.job(job_id).await?
                && job.status == JobStatus::Cancelled
            {
                return Err(CatalogError::Cancelled(format!("job {job_id}")));
            }
            if self.bus.depth(topic).await? <= low {
                return Ok(());
            }
        }
    }

    /// Cancel a job tree and let in-flight messages drain as no-ops.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Vec<JobId>> {
        self.ledger.cancel_tree(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::RetryConfig;
    use crate::index::MemoryIndex;
    use crate::ledger::MemoryLedger;
    use crate::walker::InMemoryFs;
    use std::path::PathBuf;

    struct Harness {
        coordinator: ScanCoordinator,
        catalog: CatalogStore,
        bus: Arc<MemoryBus>,
        library: Library,
    }

    async fn harness(fs: InMemoryFs) -> Harness {
        let catalog = CatalogStore::in_memory();
        let bus = Arc::new(MemoryBus::new(1_000, RetryConfig::default()));
        let library =
            Library::new("photos", PathBuf::from("/lib"));
        catalog.libraries.insert_library(&library).await.unwrap();
        let coordinator = ScanCoordinator::new(
            catalog.clone(),
            Arc::new(MemoryLedger::new()),
            bus.clone(),
            Arc::new(MemoryIndex::new()),
            Arc::new(fs) as Arc<dyn FileSystem>,
            Arc::new(PipelineConfig::default()),
        );
        Harness {
            coordinator,
            catalog,
            bus,
            library,
        }
    }

    fn two_album_fs() -> InMemoryFs {
        let mut fs = InMemoryFs::new();
        fs.add_dir("/lib/albumA");
        fs.add_file("/lib/albumA/a.jpg", 10);
        fs.add_file("/lib/bundle.zip", 20);
        fs
    }

    #[tokio::test]
    async fn duplicate_scan_requests_coalesce() {
        let h = harness(two_album_fs()).await;
        let first = h
            .coordinator
            .begin_library_scan(h.library.id, false)
            .await
            .unwrap();
        let second = h
            .coordinator
            .begin_library_scan(h.library.id, false)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(h.bus.depth(Topic::LibraryScan).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_library_is_a_validation_error() {
        let h = harness(two_album_fs()).await;
        let err = h
            .coordinator
            .begin_library_scan(LibraryId::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Validation(_)));
    }

    #[tokio::test]
    async fn library_scan_materializes_collections_and_fans_out() {
        let h = harness(two_album_fs()).await;
        let job_id = h
            .coordinator
            .begin_library_scan(h.library.id, false)
            .await
            .unwrap();
        let job = h.coordinator.ledger.job(job_id).await.unwrap().unwrap();

        h.coordinator
            .execute_library_scan(&job, h.library.id, false)
            .await
            .unwrap();

        let collections = h
            .catalog
            .collections
            .collections_in_library(h.library.id)
            .await
            .unwrap();
        assert_eq!(collections.len(), 2);
        assert_eq!(h.bus.depth(Topic::CollectionScan).await.unwrap(), 2);

        let parent = h.coordinator.ledger.job(job_id).await.unwrap().unwrap();
        assert_eq!(parent.progress.total, 2);

        let updated = h
            .catalog
            .libraries
            .library(h.library.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.statistics.collection_count, 2);
    }

    #[tokio::test]
    async fn foreign_library_path_fails_that_candidate_only() {
        let h = harness(two_album_fs()).await;
        // The album path already belongs to another library.
        let foreign = Collection::new(
            LibraryId::new(),
            "albumA",
            PathBuf::from("/lib/albumA"),
            vitrine_model::collection::CollectionKind::Directory,
        );
        h.catalog
            .collections
            .insert_collection(&foreign)
            .await
            .unwrap();

        let job_id = h
            .coordinator
            .begin_library_scan(h.library.id, false)
            .await
            .unwrap();
        let job = h.coordinator.ledger.job(job_id).await.unwrap().unwrap();
        h.coordinator
            .execute_library_scan(&job, h.library.id, false)
            .await
            .unwrap();

        let parent = h.coordinator.ledger.job(job_id).await.unwrap().unwrap();
        assert_eq!(parent.progress.failed, 1);
        // The zip candidate still fanned out.
        assert_eq!(h.bus.depth(Topic::CollectionScan).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_root_is_fatal_for_the_scan() {
        let h = harness(InMemoryFs::new()).await;
        let job_id = h
            .coordinator
            .begin_library_scan(h.library.id, false)
            .await
            .unwrap();
        let job = h.coordinator.ledger.job(job_id).await.unwrap().unwrap();
        let err = h
            .coordinator
            .execute_library_scan(&job, h.library.id, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }
}
