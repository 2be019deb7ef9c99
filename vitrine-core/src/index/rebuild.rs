//! Index rebuild and consistency maintenance.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};
use vitrine_model::collection::Collection;
use vitrine_model::index::{CollectionFilter, IndexEntry};

use super::CollectionIndex;
use crate::derivative::DerivativeEngine;
use crate::error::Result;
use crate::store::CatalogStore;

/// Preview blobs beyond this size are re-encoded before entering the index.
const PREVIEW_BYTE_LIMIT: usize = 4 * 1024;

/// Rebuilds the index from the catalog store and watches for divergence.
/// At most one rebuild runs at a time; readers fall back to the catalog
/// while the index is invalid instead of blocking.
pub struct IndexMaintainer {
    catalog: CatalogStore,
    index: Arc<dyn CollectionIndex>,
    engine: DerivativeEngine,
    rebuild_threshold_ratio: f64,
    rebuilding: AtomicBool,
}

impl std::fmt::Debug for IndexMaintainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexMaintainer")
            .field(
                "rebuild_threshold_ratio",
                &self.rebuild_threshold_ratio,
            )
            .field("rebuilding", &self.rebuilding.load(Ordering::Relaxed))
            .finish()
    }
}

impl IndexMaintainer {
    pub fn new(
        catalog: CatalogStore,
        index: Arc<dyn CollectionIndex>,
        engine: DerivativeEngine,
        rebuild_threshold_ratio: f64,
    ) -> Self {
        Self {
            catalog,
            index,
            engine,
            rebuild_threshold_ratio,
            rebuilding: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> &Arc<dyn CollectionIndex> {
        &self.index
    }

    /// Full reconstruction from the catalog store. Returns the entry count,
    /// or `None` when another rebuild was already in flight.
    pub async fn rebuild(&self) -> Result<Option<u64>> {
        if self
            .rebuilding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        let result = self.rebuild_inner().await;
        self.rebuilding.store(false, Ordering::Release);
        result.map(Some)
    }

    async fn rebuild_inner(&self) -> Result<u64> {
        self.index.set_valid(false).await?;
        self.index.clear().await?;

        let collections = self.catalog.collections.active_collections().await?;
        let mut count = 0u64;
        for collection in &collections {
            let preview = self.preview_for(collection).await;
            let entry = IndexEntry::from_collection(collection, preview);
            self.index.upsert_entry(&entry).await?;
            count += 1;
        }

        self.index.set_valid(true).await?;
        self.catalog
            .settings
            .put_setting(
                "index.last_rebuild",
                serde_json::json!({
                    "at": chrono::Utc::now(),
                    "entries": count,
                }),
            )
            .await?;
        info!(target: "index::rebuild", entries = count, "index rebuilt");
        Ok(count)
    }

    /// Rebuild when the index is invalid or its count diverges from the
    /// catalog by more than the configured fraction of the catalog size.
    /// Returns true when a rebuild ran.
    pub async fn ensure_consistent(&self) -> Result<bool> {
        let needs_rebuild = if !self.index.is_valid().await? {
            true
        } else {
            let indexed = self.index.count(&CollectionFilter::any()).await?;
            let authoritative = self.catalog.collections.count_active().await?;
            let divergence = indexed.abs_diff(authoritative) as f64
                / authoritative.max(1) as f64;
            divergence > self.rebuild_threshold_ratio
        };

        if !needs_rebuild {
            return Ok(false);
        }
        Ok(self.rebuild().await?.is_some())
    }

    /// Derive the entry's preview blob from the first media item's
    /// thumbnail file, when one exists on disk.
    async fn preview_for(&self, collection: &Collection) -> Option<Vec<u8>> {
        let first_item = collection
            .media_items
            .iter()
            .min_by_key(|item| item.insertion_order)?;
        let thumbnail = collection
            .thumbnails
            .iter()
            .find(|t| t.media_item_id == first_item.id)?;

        match tokio::fs::read(&thumbnail.path).await {
            Ok(bytes) if bytes.len() <= PREVIEW_BYTE_LIMIT => Some(bytes),
            Ok(bytes) => self
                .engine
                .render_preview(&bytes, &thumbnail.path.display().to_string())
                .ok(),
            Err(err) => {
                warn!(
                    target: "index::rebuild",
                    collection = %collection.id,
                    path = %thumbnail.path.display(),
                    error = %err,
                    "thumbnail unreadable; entry indexed without preview"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use std::path::PathBuf;
    use vitrine_model::collection::CollectionKind;
    use vitrine_model::ids::LibraryId;
    use vitrine_model::index::{SortDirection, SortKey};

    fn maintainer_with_index() -> (IndexMaintainer, Arc<MemoryIndex>) {
        let index = Arc::new(MemoryIndex::new());
        let maintainer = IndexMaintainer::new(
            CatalogStore::in_memory(),
            index.clone(),
            DerivativeEngine::default(),
            0.5,
        );
        (maintainer, index)
    }

    async fn seed_collections(catalog: &CatalogStore, n: usize) {
        for i in 0..n {
            let collection = Collection::new(
                LibraryId::new(),
                format!("c{i}"),
                PathBuf::from(format!("/data/c{i}")),
                CollectionKind::Directory,
            );
            catalog
                .collections
                .insert_collection(&collection)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn rebuild_reconstructs_all_active_collections() {
        let (maintainer, index) = maintainer_with_index();
        seed_collections(&maintainer.catalog, 4).await;

        let count = maintainer.rebuild().await.unwrap();
        assert_eq!(count, Some(4));
        assert!(index.is_valid().await.unwrap());
        assert!(
            maintainer
                .catalog
                .settings
                .setting("index.last_rebuild")
                .await
                .unwrap()
                .is_some()
        );
        let page = index
            .list_page(
                SortKey::DisplayName,
                SortDirection::Ascending,
                &CollectionFilter::any(),
                0,
                10,
            )
            .await
            .unwrap();
        assert_eq!(page.total, 4);
    }

    #[tokio::test]
    async fn small_divergence_is_tolerated_large_triggers_rebuild() {
        let (maintainer, index) = maintainer_with_index();
        seed_collections(&maintainer.catalog, 2).await;
        maintainer.rebuild().await.unwrap();

        // One entry missing out of three is a third, under the 0.5 ratio.
        seed_collections(&maintainer.catalog, 1).await;
        assert!(!maintainer.ensure_consistent().await.unwrap());

        // Two indexed out of seven diverges well past the ratio.
        seed_collections(&maintainer.catalog, 4).await;
        assert!(maintainer.ensure_consistent().await.unwrap());
        assert_eq!(
            index.count(&CollectionFilter::any()).await.unwrap(),
            7
        );
    }

    #[tokio::test]
    async fn invalid_index_always_rebuilds() {
        let (maintainer, index) = maintainer_with_index();
        index.set_valid(false).await.unwrap();
        assert!(maintainer.ensure_consistent().await.unwrap());
        assert!(index.is_valid().await.unwrap());
    }
}
