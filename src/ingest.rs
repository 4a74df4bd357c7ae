//! Decoding, validation and tiling of uploaded imagery.

mod padding;
pub mod tile;

use std::io::Cursor;
use std::path::Path;

use image::{ImageFormat, ImageReader, Limits, RgbImage};

use crate::config::IngestConfig;
use crate::errors::{DetectionError, Result};

pub use tile::{Normalizer, Tile, TileGrid, TileRect};

/// Formats accepted from the upload collaborator.
pub const SUPPORTED_FORMATS: [ImageFormat; 3] =
    [ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::Tiff];

/// A decoded upload. Lives for one detection request.
#[derive(Debug, Clone)]
pub struct InputImage {
    pub pixels: RgbImage,
    pub format: ImageFormat,
    pub byte_size: usize,
}

impl InputImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn total_pixels(&self) -> u64 {
        u64::from(self.width()) * u64::from(self.height())
    }
}

pub fn is_supported_format(format: ImageFormat) -> bool {
    SUPPORTED_FORMATS.contains(&format)
}

/// Accepts `png`, `photo.JPG`, `image/tiff` and similar declarations.
pub fn is_supported_declaration(declared: &str) -> bool {
    declared_format(declared).is_some_and(is_supported_format)
}

fn declared_format(declared: &str) -> Option<ImageFormat> {
    let declared = declared.trim();
    if declared.contains('/') && !declared.contains('.') {
        return ImageFormat::from_mime_type(declared);
    }
    let extension = Path::new(declared)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or(declared);
    ImageFormat::from_extension(extension.to_lowercase())
}

/// Decode and validate raw upload bytes.
///
/// The declared name or MIME type, when given, must name a supported format.
/// The bytes themselves decide which decoder runs; a PNG uploaded as
/// `scan.jpg` is still decoded as PNG.
pub fn decode(bytes: &[u8], declared: Option<&str>, config: &IngestConfig) -> Result<InputImage> {
    if bytes.is_empty() {
        return Err(DetectionError::invalid_image("empty payload"));
    }
    if bytes.len() > config.max_payload_bytes {
        return Err(DetectionError::invalid_image(format!(
            "payload of {} bytes exceeds the limit of {} bytes",
            bytes.len(),
            config.max_payload_bytes
        )));
    }

    if let Some(declared) = declared {
        if !is_supported_declaration(declared) {
            return Err(DetectionError::invalid_image(format!(
                "file type not allowed: {declared}. Supported formats: PNG, JPG, JPEG, TIF, TIFF"
            )));
        }
    }

    let format = image::guess_format(bytes)
        .map_err(|_| DetectionError::invalid_image("unrecognized image data"))?;
    if !is_supported_format(format) {
        return Err(DetectionError::invalid_image(format!(
            "unsupported image format: {format:?}"
        )));
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(config.max_dimension);
    limits.max_image_height = Some(config.max_dimension);

    let mut reader = ImageReader::with_format(Cursor::new(bytes), format);
    reader.limits(limits);
    let decoded = reader.decode().map_err(|e| match e {
        image::ImageError::Limits(_) => DetectionError::invalid_image(format!(
            "image dimensions too large. Max size: {0}x{0}px",
            config.max_dimension
        )),
        other => other.into(),
    })?;

    let pixels = decoded.into_rgb8();
    let (width, height) = pixels.dimensions();
    if width < config.min_dimension || height < config.min_dimension {
        return Err(DetectionError::invalid_image(format!(
            "image dimensions too small ({width}x{height}). Min size: {0}x{0}px",
            config.min_dimension
        )));
    }
    if width > config.max_dimension || height > config.max_dimension {
        return Err(DetectionError::invalid_image(format!(
            "image dimensions too large ({width}x{height}). Max size: {0}x{0}px",
            config.max_dimension
        )));
    }

    tracing::debug!(?format, width, height, bytes = bytes.len(), "decoded upload");

    Ok(InputImage {
        pixels,
        format,
        byte_size: bytes.len(),
    })
}
