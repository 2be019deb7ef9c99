//! Ordered secondary index over collections for paginated sorted browsing.
//!
//! Every sort dimension is a sorted set per direction, mirrored per library
//! and per kind; a key-value map holds the encoded [`IndexEntry`] documents
//! for batch hydration. The index is derived state: it is rebuilt from the
//! catalog store whenever it is invalid or diverges beyond a threshold, and
//! readers fall back to the catalog while it is invalid.

pub mod keys;
pub mod memory;
pub mod rebuild;
#[cfg(feature = "database")]
pub mod redis;

use async_trait::async_trait;
use vitrine_model::ids::CollectionId;
use vitrine_model::index::{
    CollectionFilter, IndexEntry, SortDirection, SortKey,
};

use crate::error::Result;

pub use memory::MemoryIndex;
pub use rebuild::IndexMaintainer;
#[cfg(feature = "database")]
pub use self::redis::RedisIndex;

/// One page of a sorted listing.
#[derive(Debug, Clone)]
pub struct Page {
    pub entries: Vec<IndexEntry>,
    pub total: u64,
}

#[async_trait]
pub trait CollectionIndex: Send + Sync {
    /// Write the entry into the entry map and every sorted set in one
    /// atomic batch.
    async fn upsert_entry(&self, entry: &IndexEntry) -> Result<()>;

    async fn remove_entry(&self, id: CollectionId) -> Result<()>;

    async fn entry(&self, id: CollectionId) -> Result<Option<IndexEntry>>;

    /// Zero-based rank of the collection in the filtered ordering.
    async fn rank(
        &self,
        id: CollectionId,
        sort: SortKey,
        dir: SortDirection,
        filter: &CollectionFilter,
    ) -> Result<Option<u64>>;

    /// Hydrated entries for the inclusive rank range `[start, stop]`.
    async fn range(
        &self,
        sort: SortKey,
        dir: SortDirection,
        filter: &CollectionFilter,
        start: u64,
        stop: u64,
    ) -> Result<Vec<IndexEntry>>;

    async fn count(&self, filter: &CollectionFilter) -> Result<u64>;

    async fn clear(&self) -> Result<()>;

    async fn is_valid(&self) -> Result<bool>;

    async fn set_valid(&self, valid: bool) -> Result<()>;

    /// One range query plus a batch hydration.
    async fn list_page(
        &self,
        sort: SortKey,
        dir: SortDirection,
        filter: &CollectionFilter,
        offset: u64,
        page_size: u64,
    ) -> Result<Page> {
        let total = self.count(filter).await?;
        if page_size == 0 || offset >= total {
            return Ok(Page {
                entries: Vec::new(),
                total,
            });
        }
        let stop = (offset + page_size - 1).min(total - 1);
        let entries = self.range(sort, dir, filter, offset, stop).await?;
        Ok(Page { entries, total })
    }

    /// Rank lookup under the control-plane name.
    async fn position(
        &self,
        id: CollectionId,
        sort: SortKey,
        dir: SortDirection,
        filter: &CollectionFilter,
    ) -> Result<Option<u64>> {
        self.rank(id, sort, dir, filter).await
    }

    /// A window of `2 * radius + 1` entries centered on the focus when
    /// possible, clamped to the listing bounds.
    async fn siblings(
        &self,
        id: CollectionId,
        radius: u64,
        sort: SortKey,
        dir: SortDirection,
        filter: &CollectionFilter,
    ) -> Result<Vec<IndexEntry>> {
        let Some(rank) = self.rank(id, sort, dir, filter).await? else {
            return Ok(Vec::new());
        };
        let total = self.count(filter).await?;
        if total == 0 {
            return Ok(Vec::new());
        }
        let window = radius.saturating_mul(2).saturating_add(1).min(total);
        let start = rank
            .saturating_sub(radius)
            .min(total - window);
        let stop = start + window - 1;
        self.range(sort, dir, filter, start, stop).await
    }
}
