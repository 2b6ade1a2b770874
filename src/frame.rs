//! Video frame snapshots
//!
//! The session only needs something that can hand over a base64 JPEG on
//! demand. Whatever renders the scene implements [`FrameSource`].

use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;

use crate::config::FrameConfig;
use crate::{Error, Result};

/// Produces JPEG snapshots for the narration service
///
/// Snapshots run on the blocking pool, so they may read files and encode
/// images without holding up the session.
pub trait FrameSource: Send {
    /// Capture the current frame as base64 JPEG
    ///
    /// Returns `Ok(None)` when no frame is available yet.
    ///
    /// # Errors
    ///
    /// Returns error if a frame exists but cannot be encoded
    fn snapshot(&mut self) -> Result<Option<String>>;
}

/// Encode an image as base64 JPEG, shrinking it to fit `max_dimension`
///
/// # Errors
///
/// Returns error if JPEG encoding fails
pub fn encode_jpeg(image: &DynamicImage, quality: u8, max_dimension: u32) -> Result<String> {
    let image = if image.width() > max_dimension || image.height() > max_dimension {
        image.thumbnail(max_dimension, max_dimension)
    } else {
        image.clone()
    };

    let rgb = image.to_rgb8();
    let mut jpeg = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut jpeg, quality)
        .encode_image(&rgb)
        .map_err(|e| Error::Frame(e.to_string()))?;

    Ok(STANDARD.encode(jpeg.into_inner()))
}

/// Reads the latest frame a renderer wrote to an image file
///
/// The file is re-read on every snapshot, so a renderer can keep overwriting
/// it in place.
pub struct ImageFileSource {
    path: PathBuf,
    quality: u8,
    max_dimension: u32,
}

impl ImageFileSource {
    /// Create a source for `path` using the configured encoding
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, config: &FrameConfig) -> Self {
        Self {
            path: path.into(),
            quality: config.jpeg_quality,
            max_dimension: config.max_dimension,
        }
    }

    /// Path being read
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSource for ImageFileSource {
    fn snapshot(&mut self) -> Result<Option<String>> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "no frame rendered yet");
            return Ok(None);
        }

        let image = image::open(&self.path)
            .map_err(|e| Error::Frame(format!("{}: {e}", self.path.display())))?;

        encode_jpeg(&image, self.quality, self.max_dimension).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn decode_b64_jpeg(data: &str) -> DynamicImage {
        let bytes = STANDARD.decode(data).unwrap();
        assert_eq!(&bytes[..2], &[0xff, 0xd8], "JPEG SOI marker");
        image::load_from_memory(&bytes).unwrap()
    }

    #[test]
    fn test_encode_jpeg_bounds_dimensions() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(1600, 800, Rgb([10, 20, 30])));
        let decoded = decode_b64_jpeg(&encode_jpeg(&image, 60, 400).unwrap());
        assert_eq!(decoded.width(), 400);
        assert_eq!(decoded.height(), 200);
    }

    #[test]
    fn test_small_image_keeps_size() {
        let image = DynamicImage::ImageRgba8(image::RgbaImage::new(32, 24));
        let decoded = decode_b64_jpeg(&encode_jpeg(&image, 90, 400).unwrap());
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn test_missing_file_is_no_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ImageFileSource::new(dir.path().join("stage.png"), &FrameConfig::default());
        assert!(source.snapshot().unwrap().is_none());
    }

    #[test]
    fn test_file_source_reencodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage.png");
        RgbImage::from_pixel(64, 64, Rgb([200, 200, 200]))
            .save(&path)
            .unwrap();

        let mut source = ImageFileSource::new(&path, &FrameConfig::default());
        let data = source.snapshot().unwrap().unwrap();
        let decoded = decode_b64_jpeg(&data);
        assert_eq!(decoded.width(), 64);
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stage.png");
        std::fs::write(&path, b"not an image").unwrap();

        let mut source = ImageFileSource::new(&path, &FrameConfig::default());
        assert!(matches!(source.snapshot(), Err(Error::Frame(_))));
    }
}
