//! In-memory catalog used by tests and the server's ephemeral mode.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use vitrine_model::cache_folder::CacheFolder;
use vitrine_model::collection::Collection;
use vitrine_model::ids::{
    CacheFolderId, CollectionId, LibraryId, MediaItemId, ScheduledJobId,
};
use vitrine_model::library::Library;
use vitrine_model::schedule::{ScheduledJob, ScheduledJobRun};

use super::{
    CacheFolderStore, CollectionStore, LibraryStore, ProcessingStage,
    ProcessingState, ProcessingStateStore, ScheduleStore, SettingsStore,
    StageSettlement, StageState,
};
use crate::error::{CatalogError, Result};

#[derive(Default)]
struct State {
    libraries: HashMap<LibraryId, Library>,
    collections: HashMap<CollectionId, Collection>,
    cache_folders: HashMap<CacheFolderId, CacheFolder>,
    processing: HashMap<(CollectionId, MediaItemId), ProcessingState>,
    settings: HashMap<String, Value>,
    schedules: HashMap<ScheduledJobId, ScheduledJob>,
    schedule_runs: Vec<ScheduledJobRun>,
}

/// One lock over the whole catalog; writes clone documents in and out the
/// way the Postgres backend round-trips JSONB.
#[derive(Default)]
pub struct MemoryCatalog {
    state: RwLock<State>,
}

impl std::fmt::Debug for MemoryCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCatalog").finish_non_exhaustive()
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test support: recorded scheduled-run history.
    pub async fn scheduled_runs(&self) -> Vec<ScheduledJobRun> {
        self.state.read().await.schedule_runs.clone()
    }
}

#[async_trait]
impl LibraryStore for MemoryCatalog {
    async fn insert_library(&self, library: &Library) -> Result<()> {
        let mut state = self.state.write().await;
        if state.libraries.contains_key(&library.id) {
            return Err(CatalogError::Validation(format!(
                "library {} already exists",
                library.id
            )));
        }
        state.libraries.insert(library.id, library.clone());
        Ok(())
    }

    async fn library(&self, id: LibraryId) -> Result<Option<Library>> {
        Ok(self.state.read().await.libraries.get(&id).cloned())
    }

    async fn list_libraries(&self) -> Result<Vec<Library>> {
        Ok(self.state.read().await.libraries.values().cloned().collect())
    }

    async fn update_library(&self, library: &Library) -> Result<()> {
        let mut state = self.state.write().await;
        match state.libraries.get_mut(&library.id) {
            Some(stored) => {
                *stored = library.clone();
                stored.updated_at = Utc::now();
                Ok(())
            }
            None => Err(CatalogError::NotFound(format!(
                "library {}",
                library.id
            ))),
        }
    }
}

#[async_trait]
impl CollectionStore for MemoryCatalog {
    async fn insert_collection(&self, collection: &Collection) -> Result<()> {
        let mut state = self.state.write().await;
        let duplicate = state.collections.values().any(|existing| {
            existing.library_id == collection.library_id
                && existing.path == collection.path
                && !existing.deleted
        });
        if duplicate {
            return Err(CatalogError::Validation(format!(
                "collection path already exists: {}",
                collection.path.display()
            )));
        }
        state.collections.insert(collection.id, collection.clone());
        Ok(())
    }

    async fn collection(&self, id: CollectionId) -> Result<Option<Collection>> {
        Ok(self.state.read().await.collections.get(&id).cloned())
    }

    async fn collection_by_path(
        &self,
        path: &Path,
    ) -> Result<Option<Collection>> {
        let target: PathBuf = path.to_path_buf();
        Ok(self
            .state
            .read()
            .await
            .collections
            .values()
            .find(|c| c.path == target && !c.deleted)
            .cloned())
    }

    async fn collections_in_library(
        &self,
        library_id: LibraryId,
    ) -> Result<Vec<Collection>> {
        Ok(self
            .state
            .read()
            .await
            .collections
            .values()
            .filter(|c| c.library_id == library_id)
            .cloned()
            .collect())
    }

    async fn active_collections(&self) -> Result<Vec<Collection>> {
        Ok(self
            .state
            .read()
            .await
            .collections
            .values()
            .filter(|c| !c.deleted)
            .cloned()
            .collect())
    }

    async fn update_collection(
        &self,
        collection: &mut Collection,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state.collections.get_mut(&collection.id).ok_or_else(
            || CatalogError::NotFound(format!("collection {}", collection.id)),
        )?;
        if stored.version != collection.version {
            return Err(CatalogError::VersionConflict {
                entity: "collection",
                id: collection.id.to_string(),
            });
        }
        collection.version += 1;
        *stored = collection.clone();
        Ok(())
    }

    async fn count_active(&self) -> Result<u64> {
        Ok(self
            .state
            .read()
            .await
            .collections
            .values()
            .filter(|c| !c.deleted)
            .count() as u64)
    }
}

#[async_trait]
impl CacheFolderStore for MemoryCatalog {
    async fn insert_cache_folder(&self, folder: &CacheFolder) -> Result<()> {
        self.state
            .write()
            .await
            .cache_folders
            .insert(folder.id, folder.clone());
        Ok(())
    }

    async fn cache_folder(
        &self,
        id: CacheFolderId,
    ) -> Result<Option<CacheFolder>> {
        Ok(self.state.read().await.cache_folders.get(&id).cloned())
    }

    async fn list_cache_folders(&self) -> Result<Vec<CacheFolder>> {
        Ok(self
            .state
            .read()
            .await
            .cache_folders
            .values()
            .cloned()
            .collect())
    }

    async fn adjust_cache_folder_bytes(
        &self,
        id: CacheFolderId,
        delta: i64,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let folder = state.cache_folders.get_mut(&id).ok_or_else(|| {
            CatalogError::NotFound(format!("cache folder {id}"))
        })?;
        folder.current_bytes = if delta >= 0 {
            folder.current_bytes.saturating_add(delta as u64)
        } else {
            folder.current_bytes.saturating_sub(delta.unsigned_abs())
        };
        folder.updated_at = Utc::now();
        Ok(())
    }

    async fn set_cache_folder_bytes(
        &self,
        id: CacheFolderId,
        bytes: u64,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let folder = state.cache_folders.get_mut(&id).ok_or_else(|| {
            CatalogError::NotFound(format!("cache folder {id}"))
        })?;
        folder.current_bytes = bytes;
        folder.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ProcessingStateStore for MemoryCatalog {
    async fn put_processing_state(
        &self,
        state: &ProcessingState,
    ) -> Result<()> {
        self.state
            .write()
            .await
            .processing
            .insert((state.collection_id, state.media_item_id), state.clone());
        Ok(())
    }

    async fn processing_state(
        &self,
        collection_id: CollectionId,
        media_item_id: MediaItemId,
    ) -> Result<Option<ProcessingState>> {
        Ok(self
            .state
            .read()
            .await
            .processing
            .get(&(collection_id, media_item_id))
            .cloned())
    }

    async fn settle_stage(
        &self,
        collection_id: CollectionId,
        media_item_id: MediaItemId,
        stage: ProcessingStage,
        new_state: StageState,
    ) -> Result<StageSettlement> {
        let mut state = self.state.write().await;
        let record = state
            .processing
            .get_mut(&(collection_id, media_item_id))
            .ok_or_else(|| {
                CatalogError::NotFound(format!(
                    "processing state {collection_id}/{media_item_id}"
                ))
            })?;
        let was_settled = record.is_settled();
        record.set_stage(stage, new_state);
        Ok(StageSettlement {
            newly_settled: !was_settled && record.is_settled(),
            record: record.clone(),
        })
    }

    async fn collection_states(
        &self,
        collection_id: CollectionId,
    ) -> Result<Vec<ProcessingState>> {
        Ok(self
            .state
            .read()
            .await
            .processing
            .values()
            .filter(|record| record.collection_id == collection_id)
            .cloned()
            .collect())
    }

    async fn clear_collection_states(
        &self,
        collection_id: CollectionId,
    ) -> Result<()> {
        self.state
            .write()
            .await
            .processing
            .retain(|(collection, _), _| *collection != collection_id);
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for MemoryCatalog {
    async fn setting(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.state.read().await.settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: Value) -> Result<()> {
        self.state
            .write()
            .await
            .settings
            .insert(key.to_string(), value);
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for MemoryCatalog {
    async fn insert_scheduled_job(&self, job: &ScheduledJob) -> Result<()> {
        self.state.write().await.schedules.insert(job.id, job.clone());
        Ok(())
    }

    async fn scheduled_job(
        &self,
        id: ScheduledJobId,
    ) -> Result<Option<ScheduledJob>> {
        Ok(self.state.read().await.schedules.get(&id).cloned())
    }

    async fn list_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>> {
        Ok(self.state.read().await.schedules.values().cloned().collect())
    }

    async fn update_scheduled_job(&self, job: &ScheduledJob) -> Result<()> {
        let mut state = self.state.write().await;
        match state.schedules.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                stored.updated_at = Utc::now();
                Ok(())
            }
            None => Err(CatalogError::NotFound(format!(
                "scheduled job {}",
                job.id
            ))),
        }
    }

    async fn record_scheduled_run(&self, run: &ScheduledJobRun) -> Result<()> {
        self.state.write().await.schedule_runs.push(run.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitrine_model::collection::CollectionKind;

    #[tokio::test]
    async fn collection_updates_are_version_conditional() {
        let catalog = MemoryCatalog::new();
        let mut collection = Collection::new(
            LibraryId::new(),
            "album",
            PathBuf::from("/data/album"),
            CollectionKind::Directory,
        );
        catalog.insert_collection(&collection).await.unwrap();

        let mut stale = collection.clone();
        catalog.update_collection(&mut collection).await.unwrap();
        assert_eq!(collection.version, 1);

        let err = catalog.update_collection(&mut stale).await.unwrap_err();
        assert!(matches!(err, CatalogError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn duplicate_paths_are_rejected_per_library() {
        let catalog = MemoryCatalog::new();
        let library = LibraryId::new();
        let first = Collection::new(
            library,
            "album",
            PathBuf::from("/data/album"),
            CollectionKind::Directory,
        );
        catalog.insert_collection(&first).await.unwrap();

        let second = Collection::new(
            library,
            "album again",
            PathBuf::from("/data/album"),
            CollectionKind::Directory,
        );
        let err = catalog.insert_collection(&second).await.unwrap_err();
        assert!(matches!(err, CatalogError::Validation(_)));
    }

    #[tokio::test]
    async fn cache_folder_byte_adjustments_clamp_at_zero() {
        let catalog = MemoryCatalog::new();
        let folder = CacheFolder::new("f1", PathBuf::from("/cache"), 100, 0);
        catalog.insert_cache_folder(&folder).await.unwrap();

        catalog.adjust_cache_folder_bytes(folder.id, 40).await.unwrap();
        catalog.adjust_cache_folder_bytes(folder.id, -100).await.unwrap();
        let stored = catalog.cache_folder(folder.id).await.unwrap().unwrap();
        assert_eq!(stored.current_bytes, 0);
    }

    #[tokio::test]
    async fn scheduled_runs_accumulate_history() {
        use vitrine_model::job::JobKind;
        use vitrine_model::schedule::{
            ScheduleOutcome, ScheduleType, ScheduledJob, ScheduledJobRun,
        };

        let catalog = MemoryCatalog::new();
        let job = ScheduledJob::new(
            "nightly",
            JobKind::LibraryScan,
            ScheduleType::Manual,
        );
        catalog.insert_scheduled_job(&job).await.unwrap();
        catalog
            .record_scheduled_run(&ScheduledJobRun {
                scheduled_job_id: job.id,
                fired_at: Utc::now(),
                outcome: ScheduleOutcome::Fired,
                job_id: None,
                detail: None,
            })
            .await
            .unwrap();

        let runs = catalog.scheduled_runs().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].scheduled_job_id, job.id);
    }

    #[tokio::test]
    async fn settling_all_stages_yields_an_item_outcome() {
        let catalog = MemoryCatalog::new();
        let collection_id = CollectionId::new();
        let media_item_id = MediaItemId::new();
        let mut record =
            ProcessingState::new(collection_id, media_item_id, None);
        record.thumbnail = StageState::Pending;
        record.cache = StageState::Pending;
        catalog.put_processing_state(&record).await.unwrap();

        let after_thumb = catalog
            .settle_stage(
                collection_id,
                media_item_id,
                ProcessingStage::Thumbnail,
                StageState::Completed,
            )
            .await
            .unwrap();
        assert!(!after_thumb.newly_settled);

        let after_cache = catalog
            .settle_stage(
                collection_id,
                media_item_id,
                ProcessingStage::Cache,
                StageState::Skipped,
            )
            .await
            .unwrap();
        assert!(after_cache.newly_settled);
        assert_eq!(
            after_cache.record.outcome(),
            vitrine_model::job::ItemOutcome::Skipped
        );

        // Re-settling an already-settled stage never reports a transition.
        let repeat = catalog
            .settle_stage(
                collection_id,
                media_item_id,
                ProcessingStage::Cache,
                StageState::Skipped,
            )
            .await
            .unwrap();
        assert!(!repeat.newly_settled);
    }
}
