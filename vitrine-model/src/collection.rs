use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CollectionId, LibraryId, MediaItemId};
use crate::preset::DerivativeKind;

/// Container format of a collection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum CollectionKind {
    Directory,
    Zip,
    SevenZip,
    Rar,
    Tar,
}

impl CollectionKind {
    pub fn is_archive(&self) -> bool {
        !matches!(self, CollectionKind::Directory)
    }

    /// Container kind for an archive file extension, if recognized.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "zip" | "cbz" => Some(CollectionKind::Zip),
            "7z" | "cb7" => Some(CollectionKind::SevenZip),
            "rar" | "cbr" => Some(CollectionKind::Rar),
            "tar" => Some(CollectionKind::Tar),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Directory => "directory",
            CollectionKind::Zip => "zip",
            CollectionKind::SevenZip => "sevenzip",
            CollectionKind::Rar => "rar",
            CollectionKind::Tar => "tar",
        }
    }
}

/// Image or video.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// Where the bytes of a media item live.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceLocator {
    /// Plain file on disk.
    Path { path: PathBuf },
    /// Entry inside an archive file.
    ArchiveEntry {
        archive_path: PathBuf,
        entry_name: String,
    },
}

impl SourceLocator {
    pub fn describe(&self) -> String {
        match self {
            SourceLocator::Path { path } => path.display().to_string(),
            SourceLocator::ArchiveEntry {
                archive_path,
                entry_name,
            } => format!("{}!{}", archive_path.display(), entry_name),
        }
    }
}

/// Change-detection signature captured when a media item is discovered.
///
/// Archive entries are keyed by their uncompressed size; filesystem items by
/// mtime + size (inode when the platform exposes one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OriginSignature {
    ArchiveEntry { uncompressed_size: u64 },
    FileStat {
        inode: Option<u64>,
        mtime_unix: i64,
        size: u64,
    },
}

/// One image or video embedded in a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: MediaItemId,
    pub filename: String,
    /// Normalized path relative to the collection root (or archive root),
    /// always `/`-separated. The stable rescan identity key.
    pub relative_path: String,
    /// Lowercase extension without the dot.
    pub format: String,
    pub byte_size: u64,
    pub width: u32,
    pub height: u32,
    pub duration_ms: Option<u64>,
    pub kind: MediaKind,
    /// Dense, gap-free position within the collection.
    pub insertion_order: u32,
    pub origin: OriginSignature,
}

/// Reference to a generated derivative file (or the original, when direct).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivativeRef {
    pub media_item_id: MediaItemId,
    pub format: String,
    pub width: u32,
    pub height: u32,
    /// Absolute path of the derivative file; the original media path when
    /// `is_direct`.
    pub path: PathBuf,
    pub byte_size: u64,
    pub generated_at: DateTime<Utc>,
    pub is_direct: bool,
}

/// Thumbnail reference embedded in the collection document.
pub type ThumbnailRef = DerivativeRef;
/// Cache-image reference embedded in the collection document.
pub type CacheImageRef = DerivativeRef;

/// Per-collection scan configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSettings {
    pub auto_scan: bool,
    pub generate_thumbnails: bool,
    pub generate_cache: bool,
    /// Overrides the library's allowed formats when non-empty.
    pub allowed_formats: Vec<String>,
    /// Serve originals in place of derivatives. Only meaningful for
    /// directory collections; always false for archives.
    pub use_direct_file_access: bool,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            auto_scan: true,
            generate_thumbnails: true,
            generate_cache: true,
            allowed_formats: Vec::new(),
            use_direct_file_access: false,
        }
    }
}

/// Counters reconciled on every scan write-back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionStatistics {
    pub media_count: u64,
    pub thumbnail_count: u64,
    pub cached_count: u64,
    pub total_bytes: u64,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// A media container: a directory inside a library or a single archive file.
///
/// Media items and derivative references are embedded so a single read
/// returns the full navigation state. All mutations go through a
/// compare-and-set on `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    pub library_id: LibraryId,
    pub display_name: String,
    /// Absolute path of the directory or archive file.
    pub path: PathBuf,
    pub kind: CollectionKind,
    pub settings: CollectionSettings,
    pub statistics: CollectionStatistics,
    pub media_items: Vec<MediaItem>,
    pub thumbnails: Vec<ThumbnailRef>,
    pub cache_images: Vec<CacheImageRef>,
    /// Signature of the container itself (directory or archive file mtime +
    /// size) captured at the last scan, used to skip unchanged collections.
    pub container_signature: Option<OriginSignature>,
    pub deleted: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Collection {
    pub fn new(
        library_id: LibraryId,
        display_name: impl Into<String>,
        path: PathBuf,
        kind: CollectionKind,
    ) -> Self {
        let now = Utc::now();
        let mut settings = CollectionSettings::default();
        if kind.is_archive() {
            settings.use_direct_file_access = false;
        }
        Self {
            id: CollectionId::new(),
            library_id,
            display_name: display_name.into(),
            path,
            kind,
            settings,
            statistics: CollectionStatistics::default(),
            media_items: Vec::new(),
            thumbnails: Vec::new(),
            cache_images: Vec::new(),
            container_signature: None,
            deleted: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn media_item(&self, id: MediaItemId) -> Option<&MediaItem> {
        self.media_items.iter().find(|item| item.id == id)
    }

    pub fn media_item_by_path(&self, relative_path: &str) -> Option<&MediaItem> {
        self.media_items
            .iter()
            .find(|item| item.relative_path == relative_path)
    }

    pub fn next_insertion_order(&self) -> u32 {
        self.media_items
            .iter()
            .map(|item| item.insertion_order + 1)
            .max()
            .unwrap_or(0)
    }

    fn derivative_list_mut(
        &mut self,
        kind: DerivativeKind,
    ) -> &mut Vec<DerivativeRef> {
        match kind {
            DerivativeKind::Thumbnail => &mut self.thumbnails,
            DerivativeKind::Cache => &mut self.cache_images,
        }
    }

    pub fn derivative_list(&self, kind: DerivativeKind) -> &[DerivativeRef] {
        match kind {
            DerivativeKind::Thumbnail => &self.thumbnails,
            DerivativeKind::Cache => &self.cache_images,
        }
    }

    /// Append or replace the derivative entry for a media item, keeping at
    /// most one active entry per item per derivative family.
    pub fn upsert_derivative(
        &mut self,
        kind: DerivativeKind,
        derivative: DerivativeRef,
    ) {
        let list = self.derivative_list_mut(kind);
        match list
            .iter_mut()
            .find(|existing| existing.media_item_id == derivative.media_item_id)
        {
            Some(existing) => *existing = derivative,
            None => list.push(derivative),
        }
        self.refresh_derivative_counts();
    }

    /// Drop derivative references whose media item no longer exists and
    /// recompute the thumbnail/cache counters from the embedded lists.
    pub fn refresh_derivative_counts(&mut self) {
        let present: Vec<MediaItemId> =
            self.media_items.iter().map(|item| item.id).collect();
        self.thumbnails
            .retain(|t| present.contains(&t.media_item_id));
        self.cache_images
            .retain(|c| present.contains(&c.media_item_id));
        self.statistics.media_count = self.media_items.len() as u64;
        self.statistics.thumbnail_count = self.thumbnails.len() as u64;
        self.statistics.cached_count = self.cache_images.len() as u64;
        self.statistics.total_bytes =
            self.media_items.iter().map(|item| item.byte_size).sum();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.statistics.last_activity_at = Some(self.updated_at);
    }
}
