//! Decode source pixels from bytes and encode derivative images.
//!
//! A pure capability; no state. Image work is delegated to the `image`
//! crate. Video frame extraction needs ffmpeg and is compiled in behind the
//! `ffmpeg` feature; without it, callers treat video sources as
//! non-decodable and skip their derivatives.

use std::io::Cursor;

use image::DynamicImage;
use image::imageops::FilterType;
use vitrine_model::preset::ImageFormat;

use crate::error::{CatalogError, Result};

/// Decoded pixels plus source dimensions.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub pixels: DynamicImage,
}

impl DecodedImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Encoded derivative bytes plus their dimensions.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

/// Stateless decode/encode capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecGateway;

impl CodecGateway {
    pub fn new() -> Self {
        Self
    }

    /// Decode an image from raw bytes. `context` names the source for error
    /// reporting.
    pub fn decode_image(
        &self,
        bytes: &[u8],
        context: &str,
    ) -> Result<DecodedImage> {
        let pixels = image::load_from_memory(bytes).map_err(|err| {
            CatalogError::DecodeFailed(format!("{context}: {err}"))
        })?;
        Ok(DecodedImage { pixels })
    }

    /// Resize with the fit-inside rule: preserve aspect, never upscale.
    pub fn resize_fit(
        &self,
        image: &DecodedImage,
        max_width: u32,
        max_height: u32,
    ) -> DecodedImage {
        let (width, height) = fit_inside(
            image.width(),
            image.height(),
            max_width,
            max_height,
        );
        if (width, height) == (image.width(), image.height()) {
            return image.clone();
        }
        DecodedImage {
            pixels: image.pixels.resize(width, height, FilterType::Lanczos3),
        }
    }

    /// Encode to the target format. `quality` applies to jpeg only.
    pub fn encode(
        &self,
        image: &DecodedImage,
        format: ImageFormat,
        quality: u8,
    ) -> Result<EncodedImage> {
        let mut bytes = Vec::new();
        match format {
            ImageFormat::Jpeg => {
                // Jpeg cannot carry an alpha channel.
                let rgb = DynamicImage::ImageRgb8(image.pixels.to_rgb8());
                let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                    Cursor::new(&mut bytes),
                    quality,
                );
                rgb.write_with_encoder(encoder).map_err(|err| {
                    CatalogError::EncodeFailed(err.to_string())
                })?;
            }
            ImageFormat::Png => {
                let encoder =
                    image::codecs::png::PngEncoder::new(Cursor::new(&mut bytes));
                image.pixels.write_with_encoder(encoder).map_err(|err| {
                    CatalogError::EncodeFailed(err.to_string())
                })?;
            }
            ImageFormat::Webp => {
                let encoder = image::codecs::webp::WebPEncoder::new_lossless(
                    Cursor::new(&mut bytes),
                );
                image.pixels.write_with_encoder(encoder).map_err(|err| {
                    CatalogError::EncodeFailed(err.to_string())
                })?;
            }
        }
        Ok(EncodedImage {
            bytes,
            width: image.width(),
            height: image.height(),
            format,
        })
    }

    /// Decode the frame at t=0 of a video file.
    #[cfg(feature = "ffmpeg")]
    pub fn decode_video_frame(
        &self,
        path: &std::path::Path,
    ) -> Result<DecodedImage> {
        video::first_frame(path)
    }

    /// Container-level dimensions and duration of a video file.
    #[cfg(feature = "ffmpeg")]
    pub fn probe_video(
        &self,
        path: &std::path::Path,
    ) -> Result<VideoProbe> {
        video::probe(path)
    }
}

/// Video container metadata.
#[cfg(feature = "ffmpeg")]
#[derive(Debug, Clone, Copy)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub duration_ms: Option<u64>,
}

/// Target dimensions under the fit-inside rule: preserve aspect ratio, fit
/// within `max_width` x `max_height`, never upscale.
pub fn fit_inside(
    width: u32,
    height: u32,
    max_width: u32,
    max_height: u32,
) -> (u32, u32) {
    if width == 0 || height == 0 || max_width == 0 || max_height == 0 {
        return (width, height);
    }
    if width <= max_width && height <= max_height {
        return (width, height);
    }
    let width_ratio = max_width as f64 / width as f64;
    let height_ratio = max_height as f64 / height as f64;
    let ratio = width_ratio.min(height_ratio);
    let fitted_width = ((width as f64 * ratio).round() as u32).max(1);
    let fitted_height = ((height as f64 * ratio).round() as u32).max(1);
    (fitted_width, fitted_height)
}

#[cfg(feature = "ffmpeg")]
mod video {
    use std::path::Path;

    use ffmpeg_next::format::Pixel;
    use ffmpeg_next::media::Type;
    use ffmpeg_next::software::scaling;
    use ffmpeg_next::util::frame::video::Video;

    use super::DecodedImage;
    use crate::error::{CatalogError, Result};

    fn decode_error(path: &Path, err: impl std::fmt::Display) -> CatalogError {
        CatalogError::DecodeFailed(format!("{}: {err}", path.display()))
    }

    pub(super) fn probe(path: &Path) -> Result<super::VideoProbe> {
        ffmpeg_next::init().map_err(|err| decode_error(path, err))?;
        let input = ffmpeg_next::format::input(&path)
            .map_err(|err| decode_error(path, err))?;
        let stream = input
            .streams()
            .best(Type::Video)
            .ok_or_else(|| decode_error(path, "no video stream"))?;
        let context = ffmpeg_next::codec::context::Context::from_parameters(
            stream.parameters(),
        )
        .map_err(|err| decode_error(path, err))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|err| decode_error(path, err))?;

        let duration_ms = if input.duration() >= 0 {
            // Container duration is in AV_TIME_BASE (microsecond) units.
            Some(input.duration() as u64 / 1_000)
        } else {
            None
        };
        Ok(super::VideoProbe {
            width: decoder.width(),
            height: decoder.height(),
            duration_ms,
        })
    }

    pub(super) fn first_frame(path: &Path) -> Result<DecodedImage> {
        ffmpeg_next::init().map_err(|err| decode_error(path, err))?;

        let mut input = ffmpeg_next::format::input(&path)
            .map_err(|err| decode_error(path, err))?;
        let stream = input
            .streams()
            .best(Type::Video)
            .ok_or_else(|| decode_error(path, "no video stream"))?;
        let stream_index = stream.index();

        let context = ffmpeg_next::codec::context::Context::from_parameters(
            stream.parameters(),
        )
        .map_err(|err| decode_error(path, err))?;
        let mut decoder = context
            .decoder()
            .video()
            .map_err(|err| decode_error(path, err))?;
        let mut scaler = scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            scaling::flag::Flags::BILINEAR,
        )
        .map_err(|err| decode_error(path, err))?;

        for (packet_stream, packet) in input.packets() {
            if packet_stream.index() != stream_index {
                continue;
            }
            decoder
                .send_packet(&packet)
                .map_err(|err| decode_error(path, err))?;
            let mut frame = Video::empty();
            if decoder.receive_frame(&mut frame).is_ok() {
                let mut rgb = Video::empty();
                scaler
                    .run(&frame, &mut rgb)
                    .map_err(|err| decode_error(path, err))?;
                return frame_to_image(path, &rgb);
            }
        }

        Err(decode_error(path, "no decodable frame"))
    }

    fn frame_to_image(path: &Path, frame: &Video) -> Result<DecodedImage> {
        let width = frame.width();
        let height = frame.height();
        let stride = frame.stride(0);
        let data = frame.data(0);
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(&data[start..start + width as usize * 3]);
        }
        let buffer = image::RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| decode_error(path, "frame buffer mismatch"))?;
        Ok(DecodedImage {
            pixels: image::DynamicImage::ImageRgb8(buffer),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_inside_preserves_aspect_and_never_upscales() {
        assert_eq!(fit_inside(200, 200, 100, 100), (100, 100));
        assert_eq!(fit_inside(200, 100, 100, 100), (100, 50));
        assert_eq!(fit_inside(50, 50, 100, 100), (50, 50));
        assert_eq!(fit_inside(4000, 10, 100, 100), (100, 1));
    }

    #[test]
    fn jpeg_round_trip_through_the_gateway() {
        let gateway = CodecGateway::new();
        let source = DecodedImage {
            pixels: DynamicImage::new_rgb8(8, 4),
        };
        let encoded = gateway
            .encode(&source, ImageFormat::Jpeg, 85)
            .unwrap();
        assert!(!encoded.bytes.is_empty());
        let decoded = gateway.decode_image(&encoded.bytes, "test").unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 4));
    }

    #[test]
    fn decode_rejects_garbage() {
        let gateway = CodecGateway::new();
        let err = gateway.decode_image(b"not an image", "junk").unwrap_err();
        assert!(matches!(err, CatalogError::DecodeFailed(_)));
    }
}
