use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::CacheFolderId;

/// A disk location with a byte quota that holds derivatives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheFolder {
    pub id: CacheFolderId,
    pub name: String,
    pub root_path: PathBuf,
    pub max_bytes: u64,
    pub current_bytes: u64,
    /// Higher wins when several folders have room.
    pub priority: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CacheFolder {
    pub fn new(
        name: impl Into<String>,
        root_path: PathBuf,
        max_bytes: u64,
        priority: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CacheFolderId::new(),
            name: name.into(),
            root_path,
            max_bytes,
            current_bytes: 0,
            priority,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.max_bytes.saturating_sub(self.current_bytes)
    }

    pub fn has_room_for(&self, bytes: u64) -> bool {
        self.active && self.current_bytes.saturating_add(bytes) <= self.max_bytes
    }

    /// Fraction of the quota in use, in `[0, 1]`.
    pub fn fill_ratio(&self) -> f64 {
        if self.max_bytes == 0 {
            return 1.0;
        }
        self.current_bytes as f64 / self.max_bytes as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_check_respects_the_quota_boundary() {
        let mut folder =
            CacheFolder::new("f1", PathBuf::from("/cache"), 100, 0);
        folder.current_bytes = 90;
        assert!(folder.has_room_for(10));
        assert!(!folder.has_room_for(11));
    }

    #[test]
    fn inactive_folders_never_have_room() {
        let mut folder =
            CacheFolder::new("f1", PathBuf::from("/cache"), 100, 0);
        folder.active = false;
        assert!(!folder.has_room_for(1));
    }

    #[test]
    fn zero_quota_reads_as_full() {
        let folder = CacheFolder::new("f1", PathBuf::from("/cache"), 0, 0);
        assert_eq!(folder.fill_ratio(), 1.0);
    }
}
