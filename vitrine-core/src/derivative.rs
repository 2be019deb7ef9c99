//! Produce thumbnails and resized cache images from decoded sources.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use vitrine_model::ids::{CollectionId, MediaItemId};
use vitrine_model::preset::{DerivativePreset, ImageFormat};

use crate::codec::{CodecGateway, DecodedImage, EncodedImage};
use crate::error::{CatalogError, Result};

/// Edge length and jpeg quality of the tiny preview blob embedded in index
/// entries. The output stays well under the few-KB budget list responses
/// assume.
const PREVIEW_EDGE: u32 = 96;
const PREVIEW_QUALITY: u8 = 60;

/// Renders derivatives according to a preset; writing is a separate step so
/// allocation can happen once the output size is known.
#[derive(Debug, Clone, Copy, Default)]
pub struct DerivativeEngine {
    codec: CodecGateway,
}

impl DerivativeEngine {
    pub fn new(codec: CodecGateway) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &CodecGateway {
        &self.codec
    }

    /// Decode, fit-inside resize, and encode one derivative.
    pub fn render(
        &self,
        source_bytes: &[u8],
        preset: &DerivativePreset,
        context: &str,
    ) -> Result<EncodedImage> {
        let decoded = self.codec.decode_image(source_bytes, context)?;
        self.render_decoded(&decoded, preset)
    }

    /// Render from already-decoded pixels (video frames take this path).
    pub fn render_decoded(
        &self,
        decoded: &DecodedImage,
        preset: &DerivativePreset,
    ) -> Result<EncodedImage> {
        let resized =
            self.codec.resize_fit(decoded, preset.width, preset.height);
        self.codec.encode(&resized, preset.format, preset.quality)
    }

    /// Render the small preview blob stored in the ordered index.
    pub fn render_preview(
        &self,
        source_bytes: &[u8],
        context: &str,
    ) -> Result<Vec<u8>> {
        let decoded = self.codec.decode_image(source_bytes, context)?;
        let resized =
            self.codec.resize_fit(&decoded, PREVIEW_EDGE, PREVIEW_EDGE);
        Ok(self
            .codec
            .encode(&resized, ImageFormat::Jpeg, PREVIEW_QUALITY)?
            .bytes)
    }
}

/// On-disk derivative layout:
/// `<cache folder root>/<collection id>/<media item id>.<preset>.<ext>`.
pub fn derivative_path(
    folder_root: &Path,
    collection_id: CollectionId,
    media_item_id: MediaItemId,
    preset: &DerivativePreset,
) -> PathBuf {
    folder_root.join(collection_id.to_string()).join(format!(
        "{media_item_id}.{}.{}",
        preset.kind.file_tag(),
        preset.extension()
    ))
}

/// Atomic write: temp name in the target directory, then rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        CatalogError::Internal(format!(
            "derivative path has no parent: {}",
            path.display()
        ))
    })?;
    tokio::fs::create_dir_all(parent).await?;

    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        Uuid::new_v4().simple()
    ));

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}
