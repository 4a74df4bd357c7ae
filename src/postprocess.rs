//! Tile stitching, thresholding and morphological cleanup.

use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate, erode};
use ndarray::prelude::*;

use crate::config::PostProcessConfig;
use crate::errors::{DetectionError, Result};
use crate::ingest::TileRect;
use crate::mask::{BinaryMask, ProbabilityMap};

/// Reassembles per-tile probability maps into one full-image map.
///
/// Overlapping pixels take the mean of every tile that covers them. Tiles are
/// accumulated in index order by [`ProbabilityStitcher::stitch`], so the result
/// never depends on which tile finished first.
pub struct ProbabilityStitcher {
    sum: Array2<f32>,
    coverage: Array2<u16>,
}

impl ProbabilityStitcher {
    pub fn new(width: u32, height: u32) -> Self {
        let shape = (height as usize, width as usize);
        Self {
            sum: Array2::zeros(shape),
            coverage: Array2::zeros(shape),
        }
    }

    pub fn add(&mut self, rect: &TileRect, map: &ProbabilityMap) -> Result<()> {
        if map.dimensions() != (rect.width, rect.height) {
            return Err(DetectionError::post_processing(
                "stitch",
                format!(
                    "tile {} map is {:?}, expected {}x{}",
                    rect.index,
                    map.dimensions(),
                    rect.width,
                    rect.height
                ),
            ));
        }

        let (x0, y0) = (rect.x as usize, rect.y as usize);
        let (x1, y1) = (x0 + rect.width as usize, y0 + rect.height as usize);
        if y1 > self.sum.nrows() || x1 > self.sum.ncols() {
            return Err(DetectionError::post_processing(
                "stitch",
                format!("tile {} extends past the image", rect.index),
            ));
        }

        self.sum
            .slice_mut(s![y0..y1, x0..x1])
            .zip_mut_with(&map.values(), |acc, &p| *acc += p);
        self.coverage
            .slice_mut(s![y0..y1, x0..x1])
            .mapv_inplace(|c| c.saturating_add(1));
        Ok(())
    }

    pub fn finish(self) -> Result<ProbabilityMap> {
        if let Some(((y, x), _)) = self.coverage.indexed_iter().find(|(_, count)| **count == 0) {
            return Err(DetectionError::post_processing(
                "stitch",
                format!("pixel ({x}, {y}) not covered by any tile"),
            ));
        }

        let mut mean = self.sum;
        mean.zip_mut_with(&self.coverage, |value, &count| {
            *value = (*value / f32::from(count)).clamp(0.0, 1.0);
        });
        ProbabilityMap::new(mean)
            .map_err(|e| DetectionError::post_processing("stitch", e.to_string()))
    }

    /// Stitch a complete set of tile results, whatever order they arrived in.
    pub fn stitch(
        width: u32,
        height: u32,
        mut tiles: Vec<(TileRect, ProbabilityMap)>,
    ) -> Result<ProbabilityMap> {
        tiles.sort_by_key(|(rect, _)| rect.index);
        let mut stitcher = Self::new(width, height);
        for (rect, map) in &tiles {
            stitcher.add(rect, map)?;
        }
        stitcher.finish()
    }
}

/// Erode away specks, then dilate to restore (and bridge) what survived.
/// Erosion is off by default: it would also erase lines `2 * radius` wide.
pub fn clean(mask: BinaryMask, config: &PostProcessConfig) -> BinaryMask {
    let mut image = mask.into_image();
    if config.erosion_radius > 0 {
        image = erode(&image, Norm::LInf, config.erosion_radius);
    }
    if config.dilation_radius > 0 {
        image = dilate(&image, Norm::LInf, config.dilation_radius);
    }
    BinaryMask::from_image(image)
}

/// Threshold a stitched map and clean the result.
pub fn binarize(map: &ProbabilityMap, threshold: f32, config: &PostProcessConfig) -> BinaryMask {
    clean(map.threshold(threshold), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn rect(index: usize, x: u32, y: u32, width: u32, height: u32) -> TileRect {
        TileRect {
            index,
            x,
            y,
            width,
            height,
        }
    }

    fn filled(width: u32, height: u32, value: f32) -> ProbabilityMap {
        ProbabilityMap::new(Array2::from_elem((height as usize, width as usize), value)).unwrap()
    }

    #[test]
    fn test_overlap_is_averaged() -> Result<()> {
        let tiles = vec![
            (rect(0, 0, 0, 6, 4), filled(6, 4, 0.2)),
            (rect(1, 4, 0, 6, 4), filled(6, 4, 0.6)),
        ];
        let map = ProbabilityStitcher::stitch(10, 4, tiles)?;

        assert!((map.get(0, 0) - 0.2).abs() < 1e-6);
        assert!((map.get(4, 2) - 0.4).abs() < 1e-6);
        assert!((map.get(5, 3) - 0.4).abs() < 1e-6);
        assert!((map.get(9, 1) - 0.6).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_completion_order_does_not_matter() -> Result<()> {
        let a = (rect(0, 0, 0, 5, 5), filled(5, 5, 0.1));
        let b = (rect(1, 3, 0, 5, 5), filled(5, 5, 0.7));
        let c = (rect(2, 0, 3, 8, 5), filled(8, 5, 0.33));

        let forward = ProbabilityStitcher::stitch(8, 8, vec![a.clone(), b.clone(), c.clone()])?;
        let reversed = ProbabilityStitcher::stitch(8, 8, vec![c, b, a])?;
        assert_eq!(forward, reversed);
        Ok(())
    }

    #[test]
    fn test_uncovered_pixel_is_an_invariant_violation() {
        let tiles = vec![(rect(0, 0, 0, 4, 4), filled(4, 4, 0.5))];
        let err = ProbabilityStitcher::stitch(5, 4, tiles).unwrap_err();
        assert!(matches!(err, DetectionError::PostProcessing { .. }));
    }

    #[test]
    fn test_mismatched_tile_map_is_rejected() {
        let mut stitcher = ProbabilityStitcher::new(8, 8);
        let err = stitcher
            .add(&rect(0, 0, 0, 4, 4), &filled(3, 4, 0.5))
            .unwrap_err();
        assert!(matches!(err, DetectionError::PostProcessing { .. }));
    }

    #[test]
    fn test_clean_drops_specks_and_keeps_structures() {
        let mut image = GrayImage::new(20, 20);
        image.put_pixel(2, 2, Luma([255]));
        for y in 8..13 {
            for x in 0..20 {
                image.put_pixel(x, y, Luma([255]));
            }
        }

        let opening = PostProcessConfig {
            erosion_radius: 1,
            dilation_radius: 1,
            ..PostProcessConfig::default()
        };
        let cleaned = clean(BinaryMask::from_image(image), &opening);
        assert!(!cleaned.is_set(2, 2));
        assert!(cleaned.is_set(10, 10));
        assert!(cleaned.is_set(10, 8));
        assert!(cleaned.is_set(10, 12));
        assert!(!cleaned.is_set(10, 7));
        assert_eq!(cleaned.detected_pixels(), 100);
    }

    #[test]
    fn test_default_cleanup_keeps_thin_lines() {
        let mut image = GrayImage::new(20, 20);
        for x in 0..20 {
            image.put_pixel(x, 10, Luma([255]));
        }

        let cleaned = clean(BinaryMask::from_image(image), &PostProcessConfig::default());
        assert!(cleaned.is_set(10, 10));
        assert!(cleaned.is_set(10, 9));
        assert!(cleaned.is_set(10, 11));
        assert!(!cleaned.is_set(10, 12));
        assert_eq!(cleaned.detected_pixels(), 60);
    }

    #[test]
    fn test_zero_radius_disables_cleanup() {
        let mut image = GrayImage::new(10, 10);
        image.put_pixel(5, 5, Luma([255]));
        let config = PostProcessConfig {
            erosion_radius: 0,
            dilation_radius: 0,
            ..PostProcessConfig::default()
        };

        let cleaned = clean(BinaryMask::from_image(image), &config);
        assert_eq!(cleaned.detected_pixels(), 1);
    }

    #[test]
    fn test_binarize_is_monotonic_in_threshold() {
        let values = Array2::from_shape_fn((32, 32), |(y, x)| {
            (((x * 7 + y * 13) % 32) as f32 / 31.0).clamp(0.0, 1.0)
        });
        let map = ProbabilityMap::new(values).unwrap();
        let config = PostProcessConfig::default();

        let mut previous = u64::MAX;
        for step in 1..10 {
            let detected = binarize(&map, step as f32 / 10.0, &config).detected_pixels();
            assert!(detected <= previous);
            previous = detected;
        }
    }
}
