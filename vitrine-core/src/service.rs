//! Inbound control plane consumed by external façades.
//!
//! Validation failures surface to the caller before any side effect; all
//! accepted work is tracked through the job ledger.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{error, info};
use uuid::Uuid;
use vitrine_model::collection::Collection;
use vitrine_model::ids::{CollectionId, JobId, LibraryId, ScheduledJobId};
use vitrine_model::index::{
    CollectionFilter, IndexEntry, SortDirection, SortKey,
};
use vitrine_model::job::{JobKind, JobRecord, JobStatus};
use vitrine_model::message::{
    BulkOperation, MessageEnvelope, StagePayload, Topic,
};
use vitrine_model::schedule::{ScheduleType, ScheduledJob};

use crate::bus::MessageBus;
use crate::config::PipelineConfig;
use crate::coordinator::ScanCoordinator;
use crate::error::{CatalogError, Result};
use crate::index::{CollectionIndex, IndexMaintainer, Page};
use crate::ledger::JobLedger;
use crate::schedule::{next_run_at, parse_cron};
use crate::store::CatalogStore;
use crate::walker::fold_path;

/// Specification for a new scheduled trigger.
#[derive(Debug, Clone)]
pub struct ScheduledJobSpec {
    pub display_name: String,
    pub target_kind: JobKind,
    pub schedule: ScheduleType,
    pub enabled: bool,
    pub parameters: Map<String, Value>,
}

#[derive(Clone)]
pub struct CatalogService {
    catalog: CatalogStore,
    ledger: Arc<dyn JobLedger>,
    bus: Arc<dyn MessageBus>,
    index: Arc<dyn CollectionIndex>,
    maintainer: Arc<IndexMaintainer>,
    coordinator: ScanCoordinator,
    config: Arc<PipelineConfig>,
}

impl std::fmt::Debug for CatalogService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogService").finish_non_exhaustive()
    }
}

impl CatalogService {
    pub fn new(
        catalog: CatalogStore,
        ledger: Arc<dyn JobLedger>,
        bus: Arc<dyn MessageBus>,
        index: Arc<dyn CollectionIndex>,
        maintainer: Arc<IndexMaintainer>,
        coordinator: ScanCoordinator,
        config: Arc<PipelineConfig>,
    ) -> Self {
        Self {
            catalog,
            ledger,
            bus,
            index,
            maintainer,
            coordinator,
            config,
        }
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.ledger
    }

    pub async fn start_library_scan(
        &self,
        library_id: LibraryId,
        force: bool,
    ) -> Result<JobId> {
        self.coordinator.begin_library_scan(library_id, force).await
    }

    pub async fn start_collection_scan(
        &self,
        collection_id: CollectionId,
        force: bool,
        use_direct_file_access: Option<bool>,
    ) -> Result<JobId> {
        self.coordinator
            .begin_collection_scan(collection_id, force, use_direct_file_access)
            .await
    }

    /// Paginated sorted listing. Served from the ordered index; while the
    /// index is invalid, readers fall back to a direct catalog query and a
    /// background rebuild is kicked off.
    pub async fn list_collections(
        &self,
        sort: SortKey,
        direction: SortDirection,
        filter: CollectionFilter,
        page: u64,
        page_size: u64,
    ) -> Result<Page> {
        let offset = page.saturating_mul(page_size);
        if self.index.is_valid().await? {
            return self
                .index
                .list_page(sort, direction, &filter, offset, page_size)
                .await;
        }

        self.spawn_background_rebuild();
        let ordered = self.catalog_fallback(sort, direction, &filter).await?;
        let total = ordered.len() as u64;
        let entries = ordered
            .into_iter()
            .skip(offset as usize)
            .take(page_size as usize)
            .collect();
        Ok(Page { entries, total })
    }

    pub async fn collection_position(
        &self,
        collection_id: CollectionId,
        sort: SortKey,
        direction: SortDirection,
        filter: CollectionFilter,
    ) -> Result<Option<u64>> {
        if self.index.is_valid().await? {
            return self
                .index
                .position(collection_id, sort, direction, &filter)
                .await;
        }
        self.spawn_background_rebuild();
        let ordered = self.catalog_fallback(sort, direction, &filter).await?;
        Ok(ordered
            .iter()
            .position(|entry| entry.id == collection_id)
            .map(|rank| rank as u64))
    }

    pub async fn collection_siblings(
        &self,
        collection_id: CollectionId,
        radius: u64,
        sort: SortKey,
        direction: SortDirection,
        filter: CollectionFilter,
    ) -> Result<Vec<IndexEntry>> {
        if self.index.is_valid().await? {
            return self
                .index
                .siblings(collection_id, radius, sort, direction, &filter)
                .await;
        }
        self.spawn_background_rebuild();
        let ordered = self.catalog_fallback(sort, direction, &filter).await?;
        let total = ordered.len() as u64;
        let Some(rank) = ordered
            .iter()
            .position(|entry| entry.id == collection_id)
            .map(|rank| rank as u64)
        else {
            return Ok(Vec::new());
        };
        if total == 0 {
            return Ok(Vec::new());
        }
        let window = radius.saturating_mul(2).saturating_add(1).min(total);
        let start = rank.saturating_sub(radius).min(total - window);
        Ok(ordered
            .into_iter()
            .skip(start as usize)
            .take(window as usize)
            .collect())
    }

    /// Full index rebuild as a tracked background job.
    pub async fn rebuild_index(&self) -> Result<JobId> {
        let job = JobRecord::new(
            JobKind::BulkOperation,
            Uuid::now_v7(),
            self.config.workers.job_timeout_ms,
        )
        .with_parameter(
            "operation",
            Value::String("index_rebuild".to_string()),
        );
        self.ledger.create_job(&job).await?;

        let ledger = self.ledger.clone();
        let maintainer = self.maintainer.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            if let Err(err) = ledger.mark_running(job_id).await {
                error!(target: "service", error = %err, "rebuild job start failed");
                return;
            }
            let outcome = match maintainer.rebuild().await {
                Ok(Some(count)) => {
                    info!(target: "service", entries = count, "index rebuilt");
                    (JobStatus::Completed, None)
                }
                Ok(None) => (
                    JobStatus::Completed,
                    Some("rebuild already in flight".to_string()),
                ),
                Err(err) => (JobStatus::Failed, Some(err.to_string())),
            };
            if let Err(err) =
                ledger.finish(job_id, outcome.0, outcome.1).await
            {
                error!(target: "service", error = %err, "rebuild job finish failed");
            }
        });
        Ok(job_id)
    }

    /// Queue a bulk maintenance operation.
    pub async fn start_bulk_operation(
        &self,
        operation: BulkOperation,
    ) -> Result<JobId> {
        let collection_id = operation.collection_id();
        if self
            .catalog
            .collections
            .collection(collection_id)
            .await?
            .is_none()
        {
            return Err(CatalogError::Validation(format!(
                "unknown collection {collection_id}"
            )));
        }

        let job = JobRecord::new(
            JobKind::BulkOperation,
            Uuid::now_v7(),
            self.config.workers.job_timeout_ms,
        )
        .with_parameter(
            "collection_id",
            Value::String(collection_id.to_string()),
        );
        self.ledger.create_job(&job).await?;
        self.bus
            .publish(MessageEnvelope::new(
                job.correlation_id,
                job.id,
                StagePayload::BulkOperation { operation },
            ))
            .await?;
        Ok(job.id)
    }

    pub async fn create_scheduled_job(
        &self,
        spec: ScheduledJobSpec,
    ) -> Result<ScheduledJobId> {
        if spec.display_name.trim().is_empty() {
            return Err(CatalogError::Validation(
                "scheduled job name must not be empty".to_string(),
            ));
        }
        if let ScheduleType::Cron { expression } = &spec.schedule {
            parse_cron(expression)?;
        }

        let mut job = ScheduledJob::new(
            spec.display_name,
            spec.target_kind,
            spec.schedule,
        );
        job.enabled = spec.enabled;
        job.parameters = spec.parameters;
        job.next_run_at = next_run_at(&job, chrono::Utc::now())?;
        self.catalog.schedules.insert_scheduled_job(&job).await?;
        Ok(job.id)
    }

    pub async fn enable_scheduled_job(
        &self,
        id: ScheduledJobId,
    ) -> Result<()> {
        self.toggle_scheduled_job(id, true).await
    }

    pub async fn disable_scheduled_job(
        &self,
        id: ScheduledJobId,
    ) -> Result<()> {
        self.toggle_scheduled_job(id, false).await
    }

    async fn toggle_scheduled_job(
        &self,
        id: ScheduledJobId,
        enabled: bool,
    ) -> Result<()> {
        let mut job = self
            .catalog
            .schedules
            .scheduled_job(id)
            .await?
            .ok_or_else(|| {
                CatalogError::NotFound(format!("scheduled job {id}"))
            })?;
        job.enabled = enabled;
        job.next_run_at = if enabled {
            next_run_at(&job, chrono::Utc::now())?
        } else {
            None
        };
        self.catalog.schedules.update_scheduled_job(&job).await
    }

    pub async fn cancel_job(&self, job_id: JobId) -> Result<Vec<JobId>> {
        self.coordinator.cancel_job(job_id).await
    }

    pub async fn job(&self, job_id: JobId) -> Result<Option<JobRecord>> {
        self.ledger.job(job_id).await
    }

    /// Queue depths per topic, for operators and backpressure telemetry.
    pub async fn queue_depths(&self) -> Result<Vec<(Topic, usize)>> {
        let mut depths = Vec::with_capacity(Topic::ALL.len());
        for topic in Topic::ALL {
            depths.push((topic, self.bus.depth(topic).await?));
        }
        Ok(depths)
    }

    fn spawn_background_rebuild(&self) {
        let maintainer = self.maintainer.clone();
        tokio::spawn(async move {
            if let Err(err) = maintainer.ensure_consistent().await {
                error!(
                    target: "service",
                    error = %err,
                    "background index rebuild failed"
                );
            }
        });
    }

    /// Direct sorted query over the catalog store, used while the index is
    /// invalid.
    async fn catalog_fallback(
        &self,
        sort: SortKey,
        direction: SortDirection,
        filter: &CollectionFilter,
    ) -> Result<Vec<IndexEntry>> {
        let mut entries: Vec<IndexEntry> = self
            .catalog
            .collections
            .active_collections()
            .await?
            .iter()
            .map(|collection: &Collection| {
                IndexEntry::from_collection(collection, None)
            })
            .filter(|entry| filter.matches(entry))
            .collect();

        // Mirror the index's ordering exactly: name sorting reverses the
        // whole lexicographic member order, numeric sorting negates only
        // the score and keeps the id tie-break ascending.
        entries.sort_by(|a, b| match sort {
            SortKey::DisplayName => {
                let ordering = fold_path(&a.display_name)
                    .cmp(&fold_path(&b.display_name))
                    .then_with(|| a.id.to_string().cmp(&b.id.to_string()));
                match direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                }
            }
            _ => {
                let ordering = match direction {
                    SortDirection::Ascending => {
                        a.score(sort).cmp(&b.score(sort))
                    }
                    SortDirection::Descending => {
                        b.score(sort).cmp(&a.score(sort))
                    }
                };
                ordering.then_with(|| a.id.to_string().cmp(&b.id.to_string()))
            }
        });
        Ok(entries)
    }
}
