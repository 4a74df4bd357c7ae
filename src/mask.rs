use std::io::Cursor;
use std::path::Path;

use image::{GrayImage, ImageFormat, Luma};
use ndarray::prelude::*;

use crate::errors::{DetectionError, Result};

/// Per-pixel likelihood in `[0, 1]`, stored as `[height, width]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityMap {
    values: Array2<f32>,
}

impl ProbabilityMap {
    /// Wraps `values`, rejecting anything outside `[0, 1]` (including NaN).
    pub fn new(values: Array2<f32>) -> Result<Self> {
        if let Some(bad) = values.iter().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(DetectionError::inference(
                "probability map validation",
                format!("value {bad} outside [0, 1]"),
            ));
        }
        Ok(Self { values })
    }

    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            values: Array2::zeros((height as usize, width as usize)),
        }
    }

    pub fn width(&self) -> u32 {
        self.values.ncols() as u32
    }

    pub fn height(&self) -> u32 {
        self.values.nrows() as u32
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[[y as usize, x as usize]]
    }

    pub fn values(&self) -> ArrayView2<'_, f32> {
        self.values.view()
    }

    /// Pixel set iff its probability is at least `threshold`.
    pub fn threshold(&self, threshold: f32) -> BinaryMask {
        let image = GrayImage::from_fn(self.width(), self.height(), |x, y| {
            if self.get(x, y) >= threshold {
                Luma([BinaryMask::SET])
            } else {
                Luma([0])
            }
        });
        BinaryMask::from_image(image)
    }
}

/// Boolean grid stored as an 8-bit image (0 or 255) so it can be encoded and
/// fed to morphology directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    image: GrayImage,
}

impl BinaryMask {
    pub const SET: u8 = 255;

    /// Any non-zero pixel counts as set.
    pub fn from_image(mut image: GrayImage) -> Self {
        for pixel in image.pixels_mut() {
            if pixel[0] != 0 {
                pixel[0] = Self::SET;
            }
        }
        Self { image }
    }

    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            image: GrayImage::new(width, height),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn is_set(&self, x: u32, y: u32) -> bool {
        self.image.get_pixel(x, y)[0] != 0
    }

    pub fn detected_pixels(&self) -> u64 {
        self.image.pixels().filter(|p| p[0] != 0).count() as u64
    }

    pub fn total_pixels(&self) -> u64 {
        let (width, height) = self.dimensions();
        u64::from(width) * u64::from(height)
    }

    pub fn as_image(&self) -> &GrayImage {
        &self.image
    }

    pub fn into_image(self) -> GrayImage {
        self.image
    }

    /// PNG bytes for the persistence collaborator.
    pub fn encode_png(&self) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        self.image
            .write_to(&mut buffer, ImageFormat::Png)
            .map_err(|e| DetectionError::post_processing("mask encoding", e.to_string()))?;
        Ok(buffer.into_inner())
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        let bytes = self.encode_png()?;
        std::fs::write(path, bytes).map_err(|e| DetectionError::FileSystem {
            path: path.to_path_buf(),
            operation: "write mask".to_string(),
            source: e,
        })
    }
}
