//! Reconciliation of a collection scan against the embedded media list.
//!
//! Pure data transformation: given the currently-embedded items and the
//! freshly scanned listing, compute the new embedded list plus the work the
//! scan implies. Identity is the normalized relative path; ordering of
//! surviving items is stable across rescans, insertion orders stay dense.

use vitrine_model::collection::{
    MediaItem, MediaKind, OriginSignature, SourceLocator,
};
use vitrine_model::ids::MediaItemId;

/// One scanned media entry, from either the walker or an archive listing.
#[derive(Debug, Clone)]
pub struct ScannedMedia {
    pub relative_path: String,
    pub filename: String,
    pub format: String,
    pub byte_size: u64,
    pub kind: MediaKind,
    pub origin: OriginSignature,
    pub source: SourceLocator,
}

/// Result of reconciling a scan.
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// The collection's new embedded list, orders renumbered densely.
    pub items: Vec<MediaItem>,
    /// Items needing derivative processing (new or changed), with their
    /// byte sources.
    pub to_process: Vec<(MediaItem, SourceLocator)>,
    /// Tombstoned items whose derivatives are due for eviction.
    pub removed: Vec<MediaItem>,
    /// False when the scan matched the embedded state exactly.
    pub dirty: bool,
}

pub fn reconcile(
    existing: &[MediaItem],
    scanned: Vec<ScannedMedia>,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    // Survivors keep their relative order; lookups are by normalized path.
    let mut surviving: Vec<MediaItem> = Vec::new();
    let mut ordered_existing: Vec<&MediaItem> = existing.iter().collect();
    ordered_existing.sort_by_key(|item| item.insertion_order);

    for item in &ordered_existing {
        match scanned.iter().find(|s| s.relative_path == item.relative_path) {
            Some(fresh) => {
                if fresh.origin != item.origin {
                    let mut updated = (*item).clone();
                    updated.byte_size = fresh.byte_size;
                    updated.origin = fresh.origin.clone();
                    updated.format = fresh.format.clone();
                    plan.to_process
                        .push((updated.clone(), fresh.source.clone()));
                    surviving.push(updated);
                    plan.dirty = true;
                } else {
                    surviving.push((*item).clone());
                }
            }
            None => {
                plan.removed.push((*item).clone());
                plan.dirty = true;
            }
        }
    }

    // New items append after the survivors, in scan order.
    for fresh in scanned {
        let known = surviving
            .iter()
            .any(|item| item.relative_path == fresh.relative_path);
        if known {
            continue;
        }
        let item = MediaItem {
            id: MediaItemId::new(),
            filename: fresh.filename,
            relative_path: fresh.relative_path,
            format: fresh.format,
            byte_size: fresh.byte_size,
            width: 0,
            height: 0,
            duration_ms: None,
            kind: fresh.kind,
            insertion_order: 0,
            origin: fresh.origin,
        };
        plan.to_process.push((item.clone(), fresh.source));
        surviving.push(item);
        plan.dirty = true;
    }

    for (order, item) in surviving.iter_mut().enumerate() {
        if item.insertion_order != order as u32 {
            item.insertion_order = order as u32;
            plan.dirty = true;
        }
    }
    // Keep the processing copies in sync with the renumbered orders.
    for (item, _) in &mut plan.to_process {
        if let Some(current) = surviving
            .iter()
            .find(|s| s.relative_path == item.relative_path)
        {
            item.insertion_order = current.insertion_order;
            item.id = current.id;
        }
    }

    plan.items = surviving;
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scanned(path: &str, size: u64) -> ScannedMedia {
        ScannedMedia {
            relative_path: path.to_string(),
            filename: path.rsplit('/').next().unwrap().to_string(),
            format: "jpg".to_string(),
            byte_size: size,
            kind: MediaKind::Image,
            origin: OriginSignature::FileStat {
                inode: None,
                mtime_unix: 100,
                size,
            },
            source: SourceLocator::Path {
                path: PathBuf::from(format!("/data/album/{path}")),
            },
        }
    }

    fn embedded(path: &str, size: u64, order: u32) -> MediaItem {
        MediaItem {
            id: MediaItemId::new(),
            filename: path.rsplit('/').next().unwrap().to_string(),
            relative_path: path.to_string(),
            format: "jpg".to_string(),
            byte_size: size,
            width: 200,
            height: 200,
            duration_ms: None,
            kind: MediaKind::Image,
            insertion_order: order,
            origin: OriginSignature::FileStat {
                inode: None,
                mtime_unix: 100,
                size,
            },
        }
    }

    #[test]
    fn fresh_scan_appends_everything_in_order() {
        let plan = reconcile(
            &[],
            vec![scanned("a.jpg", 10), scanned("b.png", 20)],
        );
        assert!(plan.dirty);
        assert_eq!(plan.items.len(), 2);
        assert_eq!(plan.to_process.len(), 2);
        assert_eq!(plan.items[0].insertion_order, 0);
        assert_eq!(plan.items[1].insertion_order, 1);
    }

    #[test]
    fn unchanged_rescan_is_a_no_op() {
        let existing =
            vec![embedded("a.jpg", 10, 0), embedded("b.jpg", 20, 1)];
        let plan = reconcile(
            &existing,
            vec![scanned("a.jpg", 10), scanned("b.jpg", 20)],
        );
        assert!(!plan.dirty);
        assert!(plan.to_process.is_empty());
        assert!(plan.removed.is_empty());
        assert_eq!(plan.items[0].id, existing[0].id);
        assert_eq!(plan.items[1].id, existing[1].id);
    }

    #[test]
    fn deleted_files_are_tombstoned_and_orders_stay_dense() {
        let existing =
            vec![embedded("a.jpg", 10, 0), embedded("b.jpg", 20, 1)];
        let plan = reconcile(&existing, vec![scanned("a.jpg", 10)]);
        assert!(plan.dirty);
        assert_eq!(plan.removed.len(), 1);
        assert_eq!(plan.removed[0].relative_path, "b.jpg");
        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.items[0].insertion_order, 0);
    }

    #[test]
    fn changed_files_requeue_but_keep_identity() {
        let existing = vec![embedded("a.jpg", 10, 0)];
        let original_id = existing[0].id;
        let plan = reconcile(&existing, vec![scanned("a.jpg", 999)]);
        assert!(plan.dirty);
        assert_eq!(plan.to_process.len(), 1);
        assert_eq!(plan.to_process[0].0.id, original_id);
        assert_eq!(plan.items[0].byte_size, 999);
    }

    #[test]
    fn new_items_append_after_survivors() {
        let existing = vec![embedded("m.jpg", 10, 0)];
        let plan = reconcile(
            &existing,
            vec![scanned("a.jpg", 5), scanned("m.jpg", 10)],
        );
        // "a.jpg" sorts before "m.jpg" in the scan, but insertion order is
        // stable: the survivor keeps slot 0.
        assert_eq!(plan.items[0].relative_path, "m.jpg");
        assert_eq!(plan.items[1].relative_path, "a.jpg");
        assert_eq!(plan.items[1].insertion_order, 1);
    }
}
