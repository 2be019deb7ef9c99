//! Authoritative document store ports.
//!
//! One port per aggregate; implementations exist in-memory (tests,
//! ephemeral mode) and on Postgres. Collection writes are
//! compare-and-set on the document `version`: `update_collection` succeeds
//! only when the caller's copy is current, and bumps the version in place.

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vitrine_model::cache_folder::CacheFolder;
use vitrine_model::collection::Collection;
use vitrine_model::ids::{
    CacheFolderId, CollectionId, JobId, LibraryId, MediaItemId,
};
use vitrine_model::job::ItemOutcome;
use vitrine_model::library::Library;
use vitrine_model::schedule::{ScheduledJob, ScheduledJobRun};

use crate::error::Result;

pub use memory::MemoryCatalog;
#[cfg(feature = "database")]
pub use postgres::PostgresCatalog;

/// Per-media processing stage tracked between scans.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Thumbnail,
    Cache,
    Metadata,
}

/// State of one stage for one media item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    #[default]
    NotRequested,
    Pending,
    Completed,
    Failed,
    Skipped,
}

impl StageState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, StageState::Pending)
    }
}

/// Processing record for one media item, keyed by (collection, media item).
///
/// Derivative and metadata workers settle their stage here; the item
/// contributes one outcome to its scan job once every requested stage is
/// settled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingState {
    pub collection_id: CollectionId,
    pub media_item_id: MediaItemId,
    pub scan_job_id: Option<JobId>,
    pub thumbnail: StageState,
    pub cache: StageState,
    pub metadata: StageState,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingState {
    pub fn new(
        collection_id: CollectionId,
        media_item_id: MediaItemId,
        scan_job_id: Option<JobId>,
    ) -> Self {
        Self {
            collection_id,
            media_item_id,
            scan_job_id,
            thumbnail: StageState::NotRequested,
            cache: StageState::NotRequested,
            metadata: StageState::NotRequested,
            updated_at: Utc::now(),
        }
    }

    pub fn stage(&self, stage: ProcessingStage) -> StageState {
        match stage {
            ProcessingStage::Thumbnail => self.thumbnail,
            ProcessingStage::Cache => self.cache,
            ProcessingStage::Metadata => self.metadata,
        }
    }

    pub fn set_stage(&mut self, stage: ProcessingStage, state: StageState) {
        match stage {
            ProcessingStage::Thumbnail => self.thumbnail = state,
            ProcessingStage::Cache => self.cache = state,
            ProcessingStage::Metadata => self.metadata = state,
        }
        self.updated_at = Utc::now();
    }

    /// True once no stage is still pending.
    pub fn is_settled(&self) -> bool {
        self.thumbnail.is_settled()
            && self.cache.is_settled()
            && self.metadata.is_settled()
    }

    /// Aggregate outcome: any failure fails the item, otherwise any skip
    /// skips it.
    pub fn outcome(&self) -> ItemOutcome {
        let states = [self.thumbnail, self.cache, self.metadata];
        if states.contains(&StageState::Failed) {
            ItemOutcome::Failed
        } else if states.contains(&StageState::Skipped) {
            ItemOutcome::Skipped
        } else {
            ItemOutcome::Completed
        }
    }
}

#[async_trait]
pub trait LibraryStore: Send + Sync {
    async fn insert_library(&self, library: &Library) -> Result<()>;
    async fn library(&self, id: LibraryId) -> Result<Option<Library>>;
    async fn list_libraries(&self) -> Result<Vec<Library>>;
    async fn update_library(&self, library: &Library) -> Result<()>;
}

#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Insert a new collection. (library, path) must be unique.
    async fn insert_collection(&self, collection: &Collection) -> Result<()>;
    async fn collection(&self, id: CollectionId) -> Result<Option<Collection>>;
    /// Lookup by absolute path across all libraries.
    async fn collection_by_path(
        &self,
        path: &Path,
    ) -> Result<Option<Collection>>;
    async fn collections_in_library(
        &self,
        library_id: LibraryId,
    ) -> Result<Vec<Collection>>;
    async fn active_collections(&self) -> Result<Vec<Collection>>;
    /// Version-conditional write; bumps `collection.version` on success and
    /// returns `VersionConflict` when the caller's copy is stale.
    async fn update_collection(&self, collection: &mut Collection)
    -> Result<()>;
    async fn count_active(&self) -> Result<u64>;
}

#[async_trait]
pub trait CacheFolderStore: Send + Sync {
    async fn insert_cache_folder(&self, folder: &CacheFolder) -> Result<()>;
    async fn cache_folder(
        &self,
        id: CacheFolderId,
    ) -> Result<Option<CacheFolder>>;
    async fn list_cache_folders(&self) -> Result<Vec<CacheFolder>>;
    /// Adjust `current_bytes` by a signed delta, clamped at zero.
    async fn adjust_cache_folder_bytes(
        &self,
        id: CacheFolderId,
        delta: i64,
    ) -> Result<()>;
    /// Overwrite `current_bytes` after a reconcile pass.
    async fn set_cache_folder_bytes(
        &self,
        id: CacheFolderId,
        bytes: u64,
    ) -> Result<()>;
}

/// Result of settling one stage. `newly_settled` is true for exactly one
/// settle call per item lifecycle: the one that left no stage pending.
#[derive(Debug, Clone)]
pub struct StageSettlement {
    pub record: ProcessingState,
    pub newly_settled: bool,
}

#[async_trait]
pub trait ProcessingStateStore: Send + Sync {
    async fn put_processing_state(&self, state: &ProcessingState)
    -> Result<()>;
    async fn processing_state(
        &self,
        collection_id: CollectionId,
        media_item_id: MediaItemId,
    ) -> Result<Option<ProcessingState>>;
    /// Settle one stage atomically, reporting whether this call was the one
    /// that settled the whole item.
    async fn settle_stage(
        &self,
        collection_id: CollectionId,
        media_item_id: MediaItemId,
        stage: ProcessingStage,
        state: StageState,
    ) -> Result<StageSettlement>;
    async fn collection_states(
        &self,
        collection_id: CollectionId,
    ) -> Result<Vec<ProcessingState>>;
    async fn clear_collection_states(
        &self,
        collection_id: CollectionId,
    ) -> Result<()>;
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn setting(&self, key: &str) -> Result<Option<Value>>;
    async fn put_setting(&self, key: &str, value: Value) -> Result<()>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert_scheduled_job(&self, job: &ScheduledJob) -> Result<()>;
    async fn scheduled_job(
        &self,
        id: vitrine_model::ids::ScheduledJobId,
    ) -> Result<Option<ScheduledJob>>;
    async fn list_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>>;
    async fn update_scheduled_job(&self, job: &ScheduledJob) -> Result<()>;
    async fn record_scheduled_run(&self, run: &ScheduledJobRun) -> Result<()>;
}

/// Aggregate handle over all catalog ports, cloned into every worker.
#[derive(Clone)]
pub struct CatalogStore {
    pub libraries: Arc<dyn LibraryStore>,
    pub collections: Arc<dyn CollectionStore>,
    pub cache_folders: Arc<dyn CacheFolderStore>,
    pub processing: Arc<dyn ProcessingStateStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub schedules: Arc<dyn ScheduleStore>,
}

impl std::fmt::Debug for CatalogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogStore").finish_non_exhaustive()
    }
}

impl CatalogStore {
    /// All ports backed by one in-memory catalog.
    pub fn in_memory() -> Self {
        let catalog = Arc::new(MemoryCatalog::new());
        Self {
            libraries: catalog.clone(),
            collections: catalog.clone(),
            cache_folders: catalog.clone(),
            processing: catalog.clone(),
            settings: catalog.clone(),
            schedules: catalog,
        }
    }
}
