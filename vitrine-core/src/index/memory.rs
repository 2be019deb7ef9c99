//! In-process index backend: one BTreeSet per sorted-set key, mirroring the
//! external backend's layout exactly.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use vitrine_model::ids::CollectionId;
use vitrine_model::index::{
    CollectionFilter, IndexEntry, SortDirection, SortKey,
};

use super::CollectionIndex;
use super::keys;
use crate::error::Result;

#[derive(Default)]
struct IndexState {
    entries: HashMap<CollectionId, IndexEntry>,
    sets: HashMap<String, BTreeSet<(i64, String)>>,
    valid: bool,
}

impl IndexState {
    fn remove_members(&mut self, entry: &IndexEntry) {
        for sort in SortKey::ALL {
            let member = keys::member_for(entry, sort);
            for dir in SortDirection::ALL {
                let score = keys::score_for(entry, sort, dir);
                for key in keys::set_keys_for_entry(entry, sort, dir) {
                    if let Some(set) = self.sets.get_mut(&key) {
                        set.remove(&(score, member.clone()));
                    }
                }
            }
        }
    }

    fn insert_members(&mut self, entry: &IndexEntry) {
        for sort in SortKey::ALL {
            let member = keys::member_for(entry, sort);
            for dir in SortDirection::ALL {
                let score = keys::score_for(entry, sort, dir);
                for key in keys::set_keys_for_entry(entry, sort, dir) {
                    self.sets
                        .entry(key)
                        .or_default()
                        .insert((score, member.clone()));
                }
            }
        }
    }

    /// Ordered collection ids of the filtered listing.
    fn ordered_ids(
        &self,
        sort: SortKey,
        dir: SortDirection,
        filter: &CollectionFilter,
    ) -> Vec<CollectionId> {
        let base = keys::base_set_key(filter, sort, dir);
        let Some(set) = self.sets.get(&base) else {
            return Vec::new();
        };
        let needs_kind_filter =
            keys::intersect_set_key(filter, sort, dir).is_some();

        let members: Vec<&(i64, String)> =
            if keys::reads_in_reverse(sort, dir) {
                set.iter().rev().collect()
            } else {
                set.iter().collect()
            };

        members
            .into_iter()
            .filter_map(|(_, member)| keys::id_from_member(member, sort))
            .filter(|id| {
                if !needs_kind_filter {
                    return true;
                }
                self.entries
                    .get(id)
                    .is_some_and(|entry| filter.matches(entry))
            })
            .collect()
    }
}

/// In-memory implementation of [`CollectionIndex`]. Starts valid and
/// empty, matching a fresh backing store after a rebuild.
pub struct MemoryIndex {
    state: RwLock<IndexState>,
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryIndex").finish_non_exhaustive()
    }
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState {
                valid: true,
                ..IndexState::default()
            }),
        }
    }
}

#[async_trait]
impl CollectionIndex for MemoryIndex {
    async fn upsert_entry(&self, entry: &IndexEntry) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(old) = state.entries.get(&entry.id).cloned() {
            state.remove_members(&old);
        }
        state.insert_members(entry);
        state.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn remove_entry(&self, id: CollectionId) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(old) = state.entries.remove(&id) {
            state.remove_members(&old);
        }
        Ok(())
    }

    async fn entry(&self, id: CollectionId) -> Result<Option<IndexEntry>> {
        Ok(self.state.read().await.entries.get(&id).cloned())
    }

    async fn rank(
        &self,
        id: CollectionId,
        sort: SortKey,
        dir: SortDirection,
        filter: &CollectionFilter,
    ) -> Result<Option<u64>> {
        let state = self.state.read().await;
        Ok(state
            .ordered_ids(sort, dir, filter)
            .iter()
            .position(|candidate| *candidate == id)
            .map(|rank| rank as u64))
    }

    async fn range(
        &self,
        sort: SortKey,
        dir: SortDirection,
        filter: &CollectionFilter,
        start: u64,
        stop: u64,
    ) -> Result<Vec<IndexEntry>> {
        if stop < start {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state
            .ordered_ids(sort, dir, filter)
            .into_iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .filter_map(|id| state.entries.get(&id).cloned())
            .collect())
    }

    async fn count(&self, filter: &CollectionFilter) -> Result<u64> {
        let state = self.state.read().await;
        if filter.library_id.is_none() && filter.kind.is_none() {
            return Ok(state.entries.len() as u64);
        }
        Ok(state
            .entries
            .values()
            .filter(|entry| filter.matches(entry))
            .count() as u64)
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.sets.clear();
        Ok(())
    }

    async fn is_valid(&self) -> Result<bool> {
        Ok(self.state.read().await.valid)
    }

    async fn set_valid(&self, valid: bool) -> Result<()> {
        self.state.write().await.valid = valid;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use vitrine_model::collection::CollectionKind;
    use vitrine_model::ids::LibraryId;

    fn entry(
        name: &str,
        library_id: LibraryId,
        kind: CollectionKind,
        image_count: u64,
    ) -> IndexEntry {
        IndexEntry {
            id: CollectionId::new(),
            library_id,
            kind,
            display_name: name.to_string(),
            image_count,
            total_bytes: image_count * 100,
            updated_at: Utc::now() + Duration::seconds(image_count as i64),
            created_at: Utc::now(),
            thumbnail_preview: None,
        }
    }

    async fn seeded_index() -> (MemoryIndex, Vec<IndexEntry>, LibraryId) {
        let index = MemoryIndex::new();
        let library = LibraryId::new();
        let entries = vec![
            entry("Beta", library, CollectionKind::Directory, 5),
            entry("alpha", library, CollectionKind::Zip, 2),
            entry("Gamma", LibraryId::new(), CollectionKind::Directory, 9),
        ];
        for e in &entries {
            index.upsert_entry(e).await.unwrap();
        }
        (index, entries, library)
    }

    #[tokio::test]
    async fn name_ordering_is_case_folded_both_directions() {
        let (index, entries, _) = seeded_index().await;
        let filter = CollectionFilter::any();

        let asc = index
            .range(
                SortKey::DisplayName,
                SortDirection::Ascending,
                &filter,
                0,
                9,
            )
            .await
            .unwrap();
        let names: Vec<&str> =
            asc.iter().map(|e| e.display_name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "Beta", "Gamma"]);

        let desc = index
            .range(
                SortKey::DisplayName,
                SortDirection::Descending,
                &filter,
                0,
                9,
            )
            .await
            .unwrap();
        assert_eq!(desc[0].display_name, "Gamma");
        assert_eq!(desc[2].id, entries[1].id);
    }

    #[tokio::test]
    async fn numeric_descending_uses_negated_scores() {
        let (index, _, _) = seeded_index().await;
        let page = index
            .list_page(
                SortKey::ImageCount,
                SortDirection::Descending,
                &CollectionFilter::any(),
                0,
                10,
            )
            .await
            .unwrap();
        let counts: Vec<u64> = page.entries.iter().map(|e| e.image_count).collect();
        assert_eq!(counts, vec![9, 5, 2]);
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn rank_and_filters_compose() {
        let (index, entries, library) = seeded_index().await;
        let library_filter = CollectionFilter::library(library);
        let rank = index
            .rank(
                entries[0].id,
                SortKey::ImageCount,
                SortDirection::Ascending,
                &library_filter,
            )
            .await
            .unwrap();
        assert_eq!(rank, Some(1));

        let both = CollectionFilter {
            library_id: Some(library),
            kind: Some(CollectionKind::Zip),
        };
        assert_eq!(index.count(&both).await.unwrap(), 1);
        let page = index
            .list_page(
                SortKey::UpdatedAt,
                SortDirection::Ascending,
                &both,
                0,
                10,
            )
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].id, entries[1].id);
    }

    #[tokio::test]
    async fn siblings_center_and_clamp() {
        let index = MemoryIndex::new();
        let library = LibraryId::new();
        let mut all = Vec::new();
        for i in 0..5u64 {
            let e = entry(
                &format!("c{i}"),
                library,
                CollectionKind::Directory,
                i,
            );
            index.upsert_entry(&e).await.unwrap();
            all.push(e);
        }
        let filter = CollectionFilter::any();

        // Focus at the low edge: window clamps to the start.
        let low = index
            .siblings(
                all[0].id,
                1,
                SortKey::ImageCount,
                SortDirection::Ascending,
                &filter,
            )
            .await
            .unwrap();
        assert_eq!(low.len(), 3);
        assert_eq!(low[0].id, all[0].id);

        // Centered focus keeps the focus in the middle.
        let mid = index
            .siblings(
                all[2].id,
                1,
                SortKey::ImageCount,
                SortDirection::Ascending,
                &filter,
            )
            .await
            .unwrap();
        assert_eq!(mid[1].id, all[2].id);

        // Focus at the high edge clamps to the end.
        let high = index
            .siblings(
                all[4].id,
                2,
                SortKey::ImageCount,
                SortDirection::Ascending,
                &filter,
            )
            .await
            .unwrap();
        assert_eq!(high.len(), 5);
        assert_eq!(high[4].id, all[4].id);
    }

    #[tokio::test]
    async fn upsert_replaces_stale_members() {
        let (index, entries, _) = seeded_index().await;
        let mut updated = entries[0].clone();
        updated.display_name = "zeta".to_string();
        updated.image_count = 100;
        index.upsert_entry(&updated).await.unwrap();

        assert_eq!(index.count(&CollectionFilter::any()).await.unwrap(), 3);
        let by_count = index
            .range(
                SortKey::ImageCount,
                SortDirection::Descending,
                &CollectionFilter::any(),
                0,
                0,
            )
            .await
            .unwrap();
        assert_eq!(by_count[0].id, updated.id);
    }

    #[tokio::test]
    async fn removal_clears_every_dimension() {
        let (index, entries, _) = seeded_index().await;
        index.remove_entry(entries[2].id).await.unwrap();
        for sort in SortKey::ALL {
            for dir in SortDirection::ALL {
                let page = index
                    .list_page(sort, dir, &CollectionFilter::any(), 0, 10)
                    .await
                    .unwrap();
                assert_eq!(page.entries.len(), 2);
                assert!(page.entries.iter().all(|e| e.id != entries[2].id));
            }
        }
    }
}
