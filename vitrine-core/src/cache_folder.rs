//! Cache-folder selection and quota enforcement.
//!
//! The allocator picks a destination among active folders with room,
//! preferring the highest priority and breaking ties on the lowest fill
//! ratio. The critical section per folder spans pick, write, rename and the
//! byte-counter increment, so concurrent writers cannot oversubscribe a
//! quota.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use vitrine_model::cache_folder::CacheFolder;
use vitrine_model::ids::{CacheFolderId, CollectionId, MediaItemId};
use vitrine_model::preset::DerivativePreset;

use crate::derivative::{derivative_path, write_atomic};
use crate::error::{CatalogError, Result};
use crate::store::CacheFolderStore;

/// Outcome of a successful derivative write.
#[derive(Debug, Clone)]
pub struct StoredDerivative {
    pub cache_folder_id: CacheFolderId,
    pub path: PathBuf,
    pub byte_size: u64,
}

#[derive(Clone)]
pub struct CacheFolderAllocator {
    store: Arc<dyn CacheFolderStore>,
    locks: Arc<DashMap<CacheFolderId, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for CacheFolderAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFolderAllocator")
            .field("locked_folders", &self.locks.len())
            .finish()
    }
}

impl CacheFolderAllocator {
    pub fn new(store: Arc<dyn CacheFolderStore>) -> Self {
        Self {
            store,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, id: CacheFolderId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Active folders with room for `needed_bytes`, best candidate first.
    async fn candidates(&self, needed_bytes: u64) -> Result<Vec<CacheFolder>> {
        let mut folders: Vec<CacheFolder> = self
            .store
            .list_cache_folders()
            .await?
            .into_iter()
            .filter(|folder| folder.has_room_for(needed_bytes))
            .collect();
        folders.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| {
                    a.fill_ratio()
                        .partial_cmp(&b.fill_ratio())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(folders)
    }

    /// Write a rendered derivative into the best cache folder.
    pub async fn store_derivative(
        &self,
        collection_id: CollectionId,
        media_item_id: MediaItemId,
        preset: &DerivativePreset,
        bytes: &[u8],
    ) -> Result<StoredDerivative> {
        let needed = bytes.len() as u64;
        let candidates = self.candidates(needed).await?;
        if candidates.is_empty() {
            return Err(CatalogError::NoCacheSpace {
                needed_bytes: needed,
            });
        }

        for candidate in candidates {
            let lock = self.lock_for(candidate.id);
            let _guard = lock.lock().await;

            // Another writer may have filled the folder while we waited.
            let Some(fresh) = self.store.cache_folder(candidate.id).await?
            else {
                continue;
            };
            if !fresh.has_room_for(needed) {
                debug!(
                    target: "cache::allocator",
                    folder = %fresh.name,
                    "folder filled up while waiting; trying next"
                );
                continue;
            }

            let path = derivative_path(
                &fresh.root_path,
                collection_id,
                media_item_id,
                preset,
            );
            write_atomic(&path, bytes).await?;
            self.store
                .adjust_cache_folder_bytes(fresh.id, needed as i64)
                .await?;
            return Ok(StoredDerivative {
                cache_folder_id: fresh.id,
                path,
                byte_size: needed,
            });
        }

        Err(CatalogError::NoCacheSpace {
            needed_bytes: needed,
        })
    }

    /// The folder whose root contains `path`, if any.
    pub async fn folder_containing(
        &self,
        path: &Path,
    ) -> Result<Option<CacheFolder>> {
        Ok(self
            .store
            .list_cache_folders()
            .await?
            .into_iter()
            .find(|folder| path.starts_with(&folder.root_path)))
    }

    /// Delete a derivative file and release its bytes from the owning
    /// folder's counter. Missing files release nothing.
    pub async fn evict_file(&self, path: &Path, byte_size: u64) -> Result<()> {
        let Some(folder) = self.folder_containing(path).await? else {
            // Direct references and foreign paths are not quota-tracked.
            return Ok(());
        };

        let lock = self.lock_for(folder.id);
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                self.store
                    .adjust_cache_folder_bytes(folder.id, -(byte_size as i64))
                    .await?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    target: "cache::allocator",
                    path = %path.display(),
                    error = %err,
                    "failed to evict derivative file"
                );
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Recompute a folder's `current_bytes` from disk.
    pub async fn reconcile(&self, id: CacheFolderId) -> Result<u64> {
        let folder = self.store.cache_folder(id).await?.ok_or_else(|| {
            CatalogError::NotFound(format!("cache folder {id}"))
        })?;

        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut total = 0u64;
        let mut pending: VecDeque<PathBuf> = VecDeque::new();
        pending.push_back(folder.root_path.clone());
        while let Some(dir) = pending.pop_front() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push_back(entry.path());
                } else if meta.is_file() {
                    total += meta.len();
                }
            }
        }

        self.store.set_cache_folder_bytes(id, total).await?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CatalogStore, MemoryCatalog};
    use vitrine_model::preset::DerivativePreset;

    async fn allocator_with(
        folders: Vec<CacheFolder>,
    ) -> (CacheFolderAllocator, Arc<MemoryCatalog>) {
        let catalog = Arc::new(MemoryCatalog::new());
        for folder in &folders {
            catalog.insert_cache_folder(folder).await.unwrap();
        }
        (CacheFolderAllocator::new(catalog.clone()), catalog)
    }

    #[tokio::test]
    async fn full_high_priority_folder_fails_over_to_lower_priority() {
        let dir = tempfile::tempdir().unwrap();
        let mut full = CacheFolder::new(
            "f1",
            dir.path().join("f1"),
            100,
            10,
        );
        full.current_bytes = 100;
        let roomy = CacheFolder::new("f2", dir.path().join("f2"), 1_000, 5);
        let roomy_id = roomy.id;
        let (allocator, _) = allocator_with(vec![full, roomy]).await;

        let stored = allocator
            .store_derivative(
                CollectionId::new(),
                MediaItemId::new(),
                &DerivativePreset::thumbnail_default(),
                b"derivative",
            )
            .await
            .unwrap();
        assert_eq!(stored.cache_folder_id, roomy_id);
        assert!(stored.path.starts_with(dir.path().join("f2")));
    }

    #[tokio::test]
    async fn exhausted_folders_surface_no_cache_space() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = CacheFolder::new("f1", dir.path().join("f1"), 4, 0);
        folder.current_bytes = 4;
        let (allocator, _) = allocator_with(vec![folder]).await;

        let err = allocator
            .store_derivative(
                CollectionId::new(),
                MediaItemId::new(),
                &DerivativePreset::thumbnail_default(),
                b"too big",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::NoCacheSpace { .. }));
    }

    #[tokio::test]
    async fn writes_update_the_byte_counter() {
        let dir = tempfile::tempdir().unwrap();
        let folder = CacheFolder::new("f1", dir.path().join("f1"), 1_000, 0);
        let folder_id = folder.id;
        let (allocator, catalog) = allocator_with(vec![folder]).await;

        allocator
            .store_derivative(
                CollectionId::new(),
                MediaItemId::new(),
                &DerivativePreset::thumbnail_default(),
                b"12345",
            )
            .await
            .unwrap();
        let stored = CatalogStore {
            libraries: catalog.clone(),
            collections: catalog.clone(),
            cache_folders: catalog.clone(),
            processing: catalog.clone(),
            settings: catalog.clone(),
            schedules: catalog.clone(),
        };
        let folder = stored
            .cache_folders
            .cache_folder(folder_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(folder.current_bytes, 5);
    }

    #[tokio::test]
    async fn eviction_and_reconcile_agree_with_disk() {
        let dir = tempfile::tempdir().unwrap();
        let folder = CacheFolder::new("f1", dir.path().join("f1"), 1_000, 0);
        let folder_id = folder.id;
        let (allocator, catalog) = allocator_with(vec![folder]).await;

        let stored = allocator
            .store_derivative(
                CollectionId::new(),
                MediaItemId::new(),
                &DerivativePreset::thumbnail_default(),
                b"12345",
            )
            .await
            .unwrap();

        allocator.evict_file(&stored.path, stored.byte_size).await.unwrap();
        let folder = catalog.cache_folder(folder_id).await.unwrap().unwrap();
        assert_eq!(folder.current_bytes, 0);

        assert_eq!(allocator.reconcile(folder_id).await.unwrap(), 0);
    }
}
