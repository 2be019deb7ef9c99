//! Postgres catalog backend. Aggregates round-trip as JSONB documents with
//! the columns the query paths need extracted alongside; all queries bind
//! at runtime so the crate builds without a live database.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;
use vitrine_model::cache_folder::CacheFolder;
use vitrine_model::collection::Collection;
use vitrine_model::ids::{
    CacheFolderId, CollectionId, LibraryId, MediaItemId, ScheduledJobId,
};
use vitrine_model::library::Library;
use vitrine_model::schedule::{ScheduledJob, ScheduledJobRun};

use super::{
    CacheFolderStore, CatalogStore, CollectionStore, LibraryStore,
    ProcessingStage, ProcessingState, ProcessingStateStore, ScheduleStore,
    SettingsStore, StageSettlement, StageState,
};
use crate::error::{CatalogError, Result};

fn storage_err(err: sqlx::Error) -> CatalogError {
    CatalogError::Storage(err.to_string())
}

fn decode<T: serde::de::DeserializeOwned>(doc: Value) -> Result<T> {
    serde_json::from_value(doc)
        .map_err(|err| CatalogError::Storage(format!("document decode: {err}")))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|err| CatalogError::Storage(format!("document encode: {err}")))
}

#[derive(Clone)]
pub struct PostgresCatalog {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresCatalog")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl PostgresCatalog {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .map_err(storage_err)?;
        info!(target: "store::postgres", "connected to catalog database");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| CatalogError::Storage(err.to_string()))
    }

    /// All catalog ports backed by this connection pool.
    pub fn into_catalog_store(self) -> CatalogStore {
        let shared = std::sync::Arc::new(self);
        CatalogStore {
            libraries: shared.clone(),
            collections: shared.clone(),
            cache_folders: shared.clone(),
            processing: shared.clone(),
            settings: shared.clone(),
            schedules: shared,
        }
    }
}

#[async_trait]
impl LibraryStore for PostgresCatalog {
    async fn insert_library(&self, library: &Library) -> Result<()> {
        sqlx::query("INSERT INTO libraries (id, doc) VALUES ($1, $2)")
            .bind(library.id.0)
            .bind(encode(library)?)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn library(&self, id: LibraryId) -> Result<Option<Library>> {
        let row = sqlx::query("SELECT doc FROM libraries WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|row| decode(row.get("doc"))).transpose()
    }

    async fn list_libraries(&self) -> Result<Vec<Library>> {
        let rows = sqlx::query("SELECT doc FROM libraries")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.into_iter().map(|row| decode(row.get("doc"))).collect()
    }

    async fn update_library(&self, library: &Library) -> Result<()> {
        let result = sqlx::query(
            "UPDATE libraries SET doc = $2, updated_at = now() WHERE id = $1",
        )
        .bind(library.id.0)
        .bind(encode(library)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(format!(
                "library {}",
                library.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CollectionStore for PostgresCatalog {
    async fn insert_collection(&self, collection: &Collection) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO collections (id, library_id, path, deleted, version, doc)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(collection.id.0)
        .bind(collection.library_id.0)
        .bind(collection.path.display().to_string())
        .bind(collection.deleted)
        .bind(collection.version as i64)
        .bind(encode(collection)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::Validation(format!(
                "collection path already exists: {}",
                collection.path.display()
            )));
        }
        Ok(())
    }

    async fn collection(&self, id: CollectionId) -> Result<Option<Collection>> {
        let row = sqlx::query("SELECT doc FROM collections WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|row| decode(row.get("doc"))).transpose()
    }

    async fn collection_by_path(
        &self,
        path: &Path,
    ) -> Result<Option<Collection>> {
        let row = sqlx::query(
            "SELECT doc FROM collections WHERE path = $1 AND NOT deleted LIMIT 1",
        )
        .bind(path.display().to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.map(|row| decode(row.get("doc"))).transpose()
    }

    async fn collections_in_library(
        &self,
        library_id: LibraryId,
    ) -> Result<Vec<Collection>> {
        let rows =
            sqlx::query("SELECT doc FROM collections WHERE library_id = $1")
                .bind(library_id.0)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?;
        rows.into_iter().map(|row| decode(row.get("doc"))).collect()
    }

    async fn active_collections(&self) -> Result<Vec<Collection>> {
        let rows = sqlx::query("SELECT doc FROM collections WHERE NOT deleted")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.into_iter().map(|row| decode(row.get("doc"))).collect()
    }

    async fn update_collection(
        &self,
        collection: &mut Collection,
    ) -> Result<()> {
        let expected = collection.version;
        collection.version += 1;
        let result = sqlx::query(
            r#"
            UPDATE collections
            SET doc = $3, version = $4, deleted = $5, updated_at = now()
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(collection.id.0)
        .bind(expected as i64)
        .bind(encode(&*collection)?)
        .bind(collection.version as i64)
        .bind(collection.deleted)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            collection.version = expected;
            return Err(CatalogError::VersionConflict {
                entity: "collection",
                id: collection.id.to_string(),
            });
        }
        Ok(())
    }

    async fn count_active(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM collections WHERE NOT deleted",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(count as u64)
    }
}

#[async_trait]
impl CacheFolderStore for PostgresCatalog {
    async fn insert_cache_folder(&self, folder: &CacheFolder) -> Result<()> {
        sqlx::query(
            "INSERT INTO cache_folders (id, current_bytes, doc) VALUES ($1, $2, $3)",
        )
        .bind(folder.id.0)
        .bind(folder.current_bytes as i64)
        .bind(encode(folder)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn cache_folder(
        &self,
        id: CacheFolderId,
    ) -> Result<Option<CacheFolder>> {
        let row = sqlx::query(
            "SELECT current_bytes, doc FROM cache_folders WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.map(|row| {
            let mut folder: CacheFolder = decode(row.get("doc"))?;
            // The counter column is authoritative; the doc may lag.
            folder.current_bytes = row.get::<i64, _>("current_bytes") as u64;
            Ok(folder)
        })
        .transpose()
    }

    async fn list_cache_folders(&self) -> Result<Vec<CacheFolder>> {
        let rows = sqlx::query("SELECT current_bytes, doc FROM cache_folders")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.into_iter()
            .map(|row| {
                let mut folder: CacheFolder = decode(row.get("doc"))?;
                folder.current_bytes =
                    row.get::<i64, _>("current_bytes") as u64;
                Ok(folder)
            })
            .collect()
    }

    async fn adjust_cache_folder_bytes(
        &self,
        id: CacheFolderId,
        delta: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE cache_folders
            SET current_bytes = GREATEST(current_bytes + $2, 0),
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(delta)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(format!("cache folder {id}")));
        }
        Ok(())
    }

    async fn set_cache_folder_bytes(
        &self,
        id: CacheFolderId,
        bytes: u64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE cache_folders SET current_bytes = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id.0)
        .bind(bytes as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(format!("cache folder {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessingStateStore for PostgresCatalog {
    async fn put_processing_state(
        &self,
        state: &ProcessingState,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO file_processing_job_states (collection_id, media_item_id, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection_id, media_item_id) DO UPDATE SET doc = $3
            "#,
        )
        .bind(state.collection_id.0)
        .bind(state.media_item_id.0)
        .bind(encode(state)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn processing_state(
        &self,
        collection_id: CollectionId,
        media_item_id: MediaItemId,
    ) -> Result<Option<ProcessingState>> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM file_processing_job_states
            WHERE collection_id = $1 AND media_item_id = $2
            "#,
        )
        .bind(collection_id.0)
        .bind(media_item_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;
        row.map(|row| decode(row.get("doc"))).transpose()
    }

    async fn settle_stage(
        &self,
        collection_id: CollectionId,
        media_item_id: MediaItemId,
        stage: ProcessingStage,
        new_state: StageState,
    ) -> Result<StageSettlement> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let row = sqlx::query(
            r#"
            SELECT doc FROM file_processing_job_states
            WHERE collection_id = $1 AND media_item_id = $2
            FOR UPDATE
            "#,
        )
        .bind(collection_id.0)
        .bind(media_item_id.0)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_err)?
        .ok_or_else(|| {
            CatalogError::NotFound(format!(
                "processing state {collection_id}/{media_item_id}"
            ))
        })?;

        let mut record: ProcessingState = decode(row.get("doc"))?;
        let was_settled = record.is_settled();
        record.set_stage(stage, new_state);

        sqlx::query(
            r#"
            UPDATE file_processing_job_states SET doc = $3
            WHERE collection_id = $1 AND media_item_id = $2
            "#,
        )
        .bind(collection_id.0)
        .bind(media_item_id.0)
        .bind(encode(&record)?)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;

        Ok(StageSettlement {
            newly_settled: !was_settled && record.is_settled(),
            record,
        })
    }

    async fn collection_states(
        &self,
        collection_id: CollectionId,
    ) -> Result<Vec<ProcessingState>> {
        let rows = sqlx::query(
            "SELECT doc FROM file_processing_job_states WHERE collection_id = $1",
        )
        .bind(collection_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.into_iter().map(|row| decode(row.get("doc"))).collect()
    }

    async fn clear_collection_states(
        &self,
        collection_id: CollectionId,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM file_processing_job_states WHERE collection_id = $1",
        )
        .bind(collection_id.0)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for PostgresCatalog {
    async fn setting(&self, key: &str) -> Result<Option<Value>> {
        let row =
            sqlx::query("SELECT value FROM system_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn put_setting(&self, key: &str, value: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO system_settings (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = $2
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for PostgresCatalog {
    async fn insert_scheduled_job(&self, job: &ScheduledJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (id, enabled, next_run_at, doc)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(job.id.0)
        .bind(job.enabled)
        .bind(job.next_run_at)
        .bind(encode(job)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn scheduled_job(
        &self,
        id: ScheduledJobId,
    ) -> Result<Option<ScheduledJob>> {
        let row = sqlx::query("SELECT doc FROM scheduled_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(|row| decode(row.get("doc"))).transpose()
    }

    async fn list_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let rows = sqlx::query("SELECT doc FROM scheduled_jobs")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.into_iter().map(|row| decode(row.get("doc"))).collect()
    }

    async fn update_scheduled_job(&self, job: &ScheduledJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET enabled = $2, next_run_at = $3, doc = $4
            WHERE id = $1
            "#,
        )
        .bind(job.id.0)
        .bind(job.enabled)
        .bind(job.next_run_at)
        .bind(encode(job)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(format!(
                "scheduled job {}",
                job.id
            )));
        }
        Ok(())
    }

    async fn record_scheduled_run(&self, run: &ScheduledJobRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_job_runs (scheduled_job_id, fired_at, doc)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(run.scheduled_job_id.0)
        .bind(run.fired_at)
        .bind(encode(run)?)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }
}
