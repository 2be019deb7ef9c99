use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::LibraryId;
use crate::preset::{
    DEFAULT_ALLOWED_FORMATS, DEFAULT_VIDEO_FORMATS, DerivativePreset,
};

/// A configured root directory tree that the pipeline scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Library {
    pub id: LibraryId,
    pub display_name: String,
    pub root_path: PathBuf,
    pub owner_id: Option<Uuid>,
    pub active: bool,
    pub settings: LibrarySettings,
    pub statistics: LibraryStatistics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Library {
    pub fn new(display_name: impl Into<String>, root_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: LibraryId::new(),
            display_name: display_name.into(),
            root_path,
            owner_id: None,
            active: true,
            settings: LibrarySettings::default(),
            statistics: LibraryStatistics::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-library scan configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrarySettings {
    pub auto_scan: bool,
    pub scan_interval_seconds: u64,
    /// Lowercase extensions (no dot) recognized as media.
    pub allowed_formats: BTreeSet<String>,
    /// Lowercase extensions treated as video containers.
    pub video_formats: BTreeSet<String>,
    /// Glob patterns (`*`, `?`) excluded from traversal, matched against
    /// the path relative to the library root.
    pub excluded_paths: BTreeSet<String>,
    /// Files larger than this are ignored by the walker. Zero disables
    /// the limit.
    pub max_file_size: u64,
    pub thumbnail_preset: DerivativePreset,
    pub cache_preset: DerivativePreset,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            auto_scan: true,
            scan_interval_seconds: 24 * 60 * 60,
            allowed_formats: DEFAULT_ALLOWED_FORMATS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            video_formats: DEFAULT_VIDEO_FORMATS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            excluded_paths: BTreeSet::new(),
            max_file_size: 0,
            thumbnail_preset: DerivativePreset::thumbnail_default(),
            cache_preset: DerivativePreset::cache_default(),
        }
    }
}

impl LibrarySettings {
    pub fn is_allowed_format(&self, extension: &str) -> bool {
        self.allowed_formats.contains(&extension.to_ascii_lowercase())
    }

    pub fn is_video_format(&self, extension: &str) -> bool {
        self.video_formats.contains(&extension.to_ascii_lowercase())
    }
}

/// Aggregated counters maintained by the scan coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibraryStatistics {
    pub collection_count: u64,
    pub media_count: u64,
    pub total_bytes: u64,
    pub last_scan_at: Option<DateTime<Utc>>,
}
