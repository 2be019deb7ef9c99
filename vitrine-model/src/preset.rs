use serde::{Deserialize, Serialize};

/// Target encoding for a derivative.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    Webp,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
        }
    }
}

/// Which derivative family a preset produces.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DerivativeKind {
    Thumbnail,
    Cache,
}

impl DerivativeKind {
    /// Preset tag used in on-disk derivative filenames:
    /// `<media_item_id>.<tag>.<ext>`.
    pub fn file_tag(&self) -> &'static str {
        match self {
            DerivativeKind::Thumbnail => "thumb",
            DerivativeKind::Cache => "cache",
        }
    }
}

/// A named set of derivative parameters.
///
/// The fit-inside rule applies: derivatives preserve aspect ratio and are
/// never upscaled beyond the source dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivativePreset {
    pub kind: DerivativeKind,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub quality: u8,
}

impl DerivativePreset {
    /// Default thumbnail preset: 300x300 jpeg q85.
    pub fn thumbnail_default() -> Self {
        Self {
            kind: DerivativeKind::Thumbnail,
            width: 300,
            height: 300,
            format: ImageFormat::Jpeg,
            quality: 85,
        }
    }

    /// Default cache preset: 1920x1080 jpeg q85.
    pub fn cache_default() -> Self {
        Self {
            kind: DerivativeKind::Cache,
            width: 1920,
            height: 1080,
            format: ImageFormat::Jpeg,
            quality: 85,
        }
    }

    pub fn extension(&self) -> &'static str {
        self.format.extension()
    }
}

/// Formats recognized as media by default, lowercase without the dot.
pub const DEFAULT_ALLOWED_FORMATS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "gif", "bmp", "tiff", "apng", "mp4",
    "webm", "mov", "mkv", "avi", "wmv", "flv",
];

/// Subset of [`DEFAULT_ALLOWED_FORMATS`] treated as video containers.
pub const DEFAULT_VIDEO_FORMATS: &[&str] =
    &["mp4", "webm", "mov", "mkv", "avi", "wmv", "flv"];
