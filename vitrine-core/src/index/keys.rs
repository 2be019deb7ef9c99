//! Key and member encoding shared by the index backends.
//!
//! Numeric sort dimensions store the collection id as the member and the
//! attribute as the score (negated for descending sets). Name ordering
//! cannot be expressed as a numeric score, so name sets store a zero score
//! and encode the case-folded name into the member; same-score members sort
//! lexicographically, which yields the name order. The descending name set
//! is read in reverse.

use vitrine_model::collection::CollectionKind;
use vitrine_model::ids::{CollectionId, LibraryId};
use vitrine_model::index::{
    CollectionFilter, IndexEntry, SortDirection, SortKey,
};

use crate::walker::fold_path;

/// Separator between the folded name and the id in name-set members. Unit
/// separator sorts below all printable characters.
pub const MEMBER_SEP: char = '\u{1f}';

pub const META_KEY: &str = "idx:meta";
pub const VALID_FIELD: &str = "valid";

pub fn entry_key(id: CollectionId) -> String {
    format!("idx:entry:{id}")
}

pub fn primary_set_key(sort: SortKey, dir: SortDirection) -> String {
    format!("idx:sort:{}:{}", sort.as_str(), dir.as_str())
}

pub fn library_set_key(
    library_id: LibraryId,
    sort: SortKey,
    dir: SortDirection,
) -> String {
    format!(
        "idx:by_library:{library_id}:{}:{}",
        sort.as_str(),
        dir.as_str()
    )
}

pub fn kind_set_key(
    kind: CollectionKind,
    sort: SortKey,
    dir: SortDirection,
) -> String {
    format!(
        "idx:by_kind:{}:{}:{}",
        kind.as_str(),
        sort.as_str(),
        dir.as_str()
    )
}

/// The sets an entry belongs to for one (sort, dir) dimension.
pub fn set_keys_for_entry(
    entry: &IndexEntry,
    sort: SortKey,
    dir: SortDirection,
) -> [String; 3] {
    [
        primary_set_key(sort, dir),
        library_set_key(entry.library_id, sort, dir),
        kind_set_key(entry.kind, sort, dir),
    ]
}

/// The base set a filtered read works against. When both filter axes are
/// present the library set is the base and the kind axis is applied by
/// intersection (or post-filtering, backend permitting).
pub fn base_set_key(
    filter: &CollectionFilter,
    sort: SortKey,
    dir: SortDirection,
) -> String {
    match (filter.library_id, filter.kind) {
        (Some(library_id), _) => library_set_key(library_id, sort, dir),
        (None, Some(kind)) => kind_set_key(kind, sort, dir),
        (None, None) => primary_set_key(sort, dir),
    }
}

/// Secondary set to intersect with, when the filter has both axes.
pub fn intersect_set_key(
    filter: &CollectionFilter,
    sort: SortKey,
    dir: SortDirection,
) -> Option<String> {
    match (filter.library_id, filter.kind) {
        (Some(_), Some(kind)) => Some(kind_set_key(kind, sort, dir)),
        _ => None,
    }
}

pub fn member_for(entry: &IndexEntry, sort: SortKey) -> String {
    match sort {
        SortKey::DisplayName => format!(
            "{}{MEMBER_SEP}{}",
            fold_path(&entry.display_name),
            entry.id
        ),
        _ => entry.id.to_string(),
    }
}

pub fn id_from_member(member: &str, sort: SortKey) -> Option<CollectionId> {
    let raw = match sort {
        SortKey::DisplayName => member.rsplit(MEMBER_SEP).next()?,
        _ => member,
    };
    CollectionId::parse(raw).ok()
}

pub fn score_for(entry: &IndexEntry, sort: SortKey, dir: SortDirection) -> i64 {
    let base = entry.score(sort);
    match dir {
        SortDirection::Ascending => base,
        SortDirection::Descending => -base,
    }
}

/// Name sets keep one lexicographic order; the descending read direction is
/// applied at query time.
pub fn reads_in_reverse(sort: SortKey, dir: SortDirection) -> bool {
    sort == SortKey::DisplayName && dir == SortDirection::Descending
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(name: &str) -> IndexEntry {
        IndexEntry {
            id: CollectionId::new(),
            library_id: LibraryId::new(),
            kind: CollectionKind::Directory,
            display_name: name.to_string(),
            image_count: 7,
            total_bytes: 9,
            updated_at: Utc::now(),
            created_at: Utc::now(),
            thumbnail_preview: None,
        }
    }

    #[test]
    fn members_round_trip_ids_for_every_sort() {
        let e = entry("Holiday Album");
        for sort in SortKey::ALL {
            let member = member_for(&e, sort);
            assert_eq!(id_from_member(&member, sort), Some(e.id));
        }
    }

    #[test]
    fn descending_numeric_scores_are_negated() {
        let e = entry("a");
        assert_eq!(
            score_for(&e, SortKey::ImageCount, SortDirection::Ascending),
            7
        );
        assert_eq!(
            score_for(&e, SortKey::ImageCount, SortDirection::Descending),
            -7
        );
    }

    #[test]
    fn filtered_reads_pick_the_narrowest_base_set() {
        let library_id = LibraryId::new();
        let both = CollectionFilter {
            library_id: Some(library_id),
            kind: Some(CollectionKind::Zip),
        };
        let base = base_set_key(&both, SortKey::UpdatedAt, SortDirection::Ascending);
        assert!(base.starts_with("idx:by_library:"));
        assert!(
            intersect_set_key(&both, SortKey::UpdatedAt, SortDirection::Ascending)
                .unwrap()
                .starts_with("idx:by_kind:zip:")
        );
    }
}
