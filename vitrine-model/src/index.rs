use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collection::{Collection, CollectionKind};
use crate::ids::{CollectionId, LibraryId};

/// Attribute a collection listing is ordered by.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    UpdatedAt,
    CreatedAt,
    DisplayName,
    ImageCount,
    TotalBytes,
}

impl SortKey {
    pub const ALL: [SortKey; 5] = [
        SortKey::UpdatedAt,
        SortKey::CreatedAt,
        SortKey::DisplayName,
        SortKey::ImageCount,
        SortKey::TotalBytes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::UpdatedAt => "updated",
            SortKey::CreatedAt => "created",
            SortKey::DisplayName => "name",
            SortKey::ImageCount => "count",
            SortKey::TotalBytes => "size",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub const ALL: [SortDirection; 2] =
        [SortDirection::Ascending, SortDirection::Descending];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "asc",
            SortDirection::Descending => "desc",
        }
    }
}

/// Secondary filter applied to a listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionFilter {
    pub library_id: Option<LibraryId>,
    pub kind: Option<CollectionKind>,
}

impl CollectionFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn library(library_id: LibraryId) -> Self {
        Self {
            library_id: Some(library_id),
            kind: None,
        }
    }

    pub fn matches(&self, entry: &IndexEntry) -> bool {
        self.library_id.is_none_or(|id| entry.library_id == id)
            && self.kind.is_none_or(|kind| entry.kind == kind)
    }
}

/// Collection summary held by the ordered index for listing responses.
///
/// `thumbnail_preview` is a small pre-encoded image blob so list pages need
/// no per-item decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: CollectionId,
    pub library_id: LibraryId,
    pub kind: CollectionKind,
    pub display_name: String,
    pub image_count: u64,
    pub total_bytes: u64,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_preview: Option<Vec<u8>>,
}

impl IndexEntry {
    /// Summarize a collection, carrying forward a previously stored preview
    /// (previews are attached separately by the derivative workers).
    pub fn from_collection(
        collection: &Collection,
        preview: Option<Vec<u8>>,
    ) -> Self {
        Self {
            id: collection.id,
            library_id: collection.library_id,
            kind: collection.kind,
            display_name: collection.display_name.clone(),
            image_count: collection.statistics.media_count,
            total_bytes: collection.statistics.total_bytes,
            updated_at: collection.updated_at,
            created_at: collection.created_at,
            thumbnail_preview: preview,
        }
    }

    /// Numeric score for the given sort key. Name ordering is handled by
    /// lexicographic member encoding, not by score.
    pub fn score(&self, key: SortKey) -> i64 {
        match key {
            SortKey::UpdatedAt => self.updated_at.timestamp_millis(),
            SortKey::CreatedAt => self.created_at.timestamp_millis(),
            SortKey::DisplayName => 0,
            SortKey::ImageCount => self.image_count as i64,
            SortKey::TotalBytes => self.total_bytes as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn entry(kind: CollectionKind, library_id: LibraryId) -> IndexEntry {
        let mut collection = Collection::new(
            library_id,
            "album",
            PathBuf::from("/data/album"),
            kind,
        );
        collection.statistics.media_count = 3;
        IndexEntry::from_collection(&collection, None)
    }

    #[test]
    fn filter_matches_by_library_and_kind() {
        let library = LibraryId::new();
        let e = entry(CollectionKind::Zip, library);

        assert!(CollectionFilter::any().matches(&e));
        assert!(CollectionFilter::library(library).matches(&e));
        assert!(!CollectionFilter::library(LibraryId::new()).matches(&e));
        let kind_filter = CollectionFilter {
            library_id: None,
            kind: Some(CollectionKind::Directory),
        };
        assert!(!kind_filter.matches(&e));
    }

    #[test]
    fn image_count_mirrors_collection_statistics() {
        let e = entry(CollectionKind::Directory, LibraryId::new());
        assert_eq!(e.image_count, 3);
        assert_eq!(e.score(SortKey::ImageCount), 3);
    }
}
