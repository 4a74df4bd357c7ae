use image::{imageops, Rgb, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;

use super::padding::pad_to;
use super::InputImage;
use crate::config::{IngestConfig, TensorLayout};
use crate::errors::{DetectionError, Result};

/// Placement of one tile inside the source image. `width`/`height` are the
/// valid (unpadded) extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRect {
    pub index: usize,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Fixed-size, overlapping tiling of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileGrid {
    pub tile_size: u32,
    pub overlap: u32,
    pub image_width: u32,
    pub image_height: u32,
    xs: Vec<u32>,
    ys: Vec<u32>,
}

impl TileGrid {
    /// Lay tiles out with a stride of `tile_size - overlap`. The last tile on
    /// each axis reaches the image edge and is padded rather than shifted or
    /// stretched. An image no larger than one tile gets exactly one tile.
    pub fn plan(image_width: u32, image_height: u32, tile_size: u32, overlap: u32) -> Self {
        let stride = tile_size.saturating_sub(overlap).max(1);
        Self {
            tile_size,
            overlap,
            image_width,
            image_height,
            xs: axis_offsets(image_width, tile_size, stride),
            ys: axis_offsets(image_height, tile_size, stride),
        }
    }

    pub fn len(&self) -> usize {
        self.xs.len() * self.ys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_single(&self) -> bool {
        self.len() == 1
    }

    /// Tiles in row-major order; `index` is the position in that order.
    pub fn rects(&self) -> Vec<TileRect> {
        self.ys
            .iter()
            .flat_map(|&y| self.xs.iter().map(move |&x| (x, y)))
            .enumerate()
            .map(|(index, (x, y))| TileRect {
                index,
                x,
                y,
                width: self.tile_size.min(self.image_width - x),
                height: self.tile_size.min(self.image_height - y),
            })
            .collect()
    }
}

fn axis_offsets(length: u32, tile_size: u32, stride: u32) -> Vec<u32> {
    let mut offsets = vec![0];
    let mut position = 0;
    while position + tile_size < length {
        position += stride;
        offsets.push(position);
    }
    offsets
}

/// Fixed scale/offset normalization into the model's tensor layout.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalizer {
    pub scale: f32,
    pub offset: f32,
    pub layout: TensorLayout,
}

impl Normalizer {
    pub const fn new(scale: f32, offset: f32, layout: TensorLayout) -> Self {
        Self {
            scale,
            offset,
            layout,
        }
    }

    pub const fn from_config(config: &IngestConfig, layout: TensorLayout) -> Self {
        Self::new(config.pixel_scale, config.pixel_offset, layout)
    }

    /// Batch-of-one tensor in standard layout.
    pub fn normalize(&self, image: &RgbImage) -> Array4<f32> {
        // as_ndarray3 yields [channel, height, width]
        let chw = image.as_ndarray3();
        let view = match self.layout {
            TensorLayout::Nchw => chw,
            TensorLayout::Nhwc => chw.permuted_axes([1, 2, 0]),
        };
        let (scale, offset) = (self.scale, self.offset);
        view.mapv(|v| f32::from(v) * scale + offset)
            .as_standard_layout()
            .into_owned()
            .insert_axis(Axis(0))
    }
}

/// A tile ready for either detection strategy.
#[derive(Debug, Clone)]
pub struct Tile {
    pub rect: TileRect,
    /// Normalized, zero-padded to `tile_size` on both axes.
    pub tensor: Array4<f32>,
    /// Unpadded source pixels, used when the tile falls back to heuristics.
    pub pixels: RgbImage,
    pub tile_size: u32,
}

impl Tile {
    pub fn extract(
        image: &InputImage,
        rect: TileRect,
        tile_size: u32,
        normalizer: &Normalizer,
    ) -> Result<Self> {
        let pixels =
            imageops::crop_imm(&image.pixels, rect.x, rect.y, rect.width, rect.height).to_image();
        let padded = pad_to(&pixels, tile_size, tile_size, Rgb([0, 0, 0])).ok_or_else(|| {
            DetectionError::post_processing(
                "tiling",
                format!(
                    "tile {} of {}x{} does not fit a {tile_size}px tile",
                    rect.index, rect.width, rect.height
                ),
            )
        })?;

        Ok(Self {
            rect,
            tensor: normalizer.normalize(&padded),
            pixels,
            tile_size,
        })
    }
}
