//! Classical-vision fallback used whenever the learned model cannot answer.
//!
//! Four binary signals are computed over the image and combined with a
//! weighted vote:
//!
//! - **color**: pixel lies inside one of the configured RGB ranges;
//! - **edge**: Sobel gradient magnitude above a fixed threshold;
//! - **geometry**: pixel belongs to a large, elongated connected component of
//!   the color/statistical candidates (thin line-like structures, not blobs);
//! - **statistical**: pixel is brighter than the image's own Otsu level.
//!
//! The score of a pixel is the sum of the (normalized) weights of the signals
//! that fire for it, so it lives in `[0, 1]` and can be thresholded exactly like
//! a model probability.

use std::panic::{catch_unwind, AssertUnwindSafe};

use image::{imageops, GrayImage, Luma, RgbImage};
use imageproc::contrast::otsu_level;
use imageproc::gradients::sobel_gradients;
use imageproc::region_labelling::{connected_components, Connectivity};
use ndarray::prelude::*;
use tracing::warn;

use crate::config::{HeuristicConfig, SignalWeights};
use crate::errors::{DetectionError, Result};
use crate::mask::ProbabilityMap;

const ON: Luma<u8> = Luma([255]);
const OFF: Luma<u8> = Luma([0]);

#[derive(Debug, Clone)]
pub struct HeuristicSegmenter {
    config: HeuristicConfig,
    weights: SignalWeights,
}

/// The individual signals, kept around for debugging and tests.
#[derive(Debug, Clone)]
pub struct Signals {
    pub color: GrayImage,
    pub edge: GrayImage,
    pub geometry: GrayImage,
    pub statistical: GrayImage,
}

impl HeuristicSegmenter {
    pub fn new(config: HeuristicConfig) -> Self {
        let weights = config.weights.normalized();
        Self { config, weights }
    }

    /// Score every pixel of `image`. Never fails: any internal problem is
    /// logged and yields an all-zero map.
    pub fn score(&self, image: &RgbImage) -> ProbabilityMap {
        let (width, height) = image.dimensions();
        match catch_unwind(AssertUnwindSafe(|| self.try_score(image))) {
            Ok(Ok(map)) => map,
            Ok(Err(e)) => {
                warn!(error = %e, width, height, "heuristic detector failed, reporting no detection");
                ProbabilityMap::zeros(width, height)
            }
            Err(_) => {
                warn!(width, height, "heuristic detector panicked, reporting no detection");
                ProbabilityMap::zeros(width, height)
            }
        }
    }

    pub fn try_score(&self, image: &RgbImage) -> Result<ProbabilityMap> {
        let signals = self.signals(image)?;
        self.combine(&signals)
    }

    pub fn signals(&self, image: &RgbImage) -> Result<Signals> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectionError::inference(
                "heuristic scoring",
                "image has no pixels",
            ));
        }

        let gray = imageops::grayscale(image);
        let ((color, statistical), edge) = rayon::join(
            || {
                rayon::join(
                    || self.color_signal(image),
                    || self.statistical_signal(&gray),
                )
            },
            || self.edge_signal(&gray),
        );
        let geometry = self.geometry_signal(&color, &statistical);

        Ok(Signals {
            color,
            edge,
            geometry,
            statistical,
        })
    }

    fn combine(&self, signals: &Signals) -> Result<ProbabilityMap> {
        let (width, height) = signals.color.dimensions();
        let weights = self.weights;
        let votes = [
            (&signals.color, weights.color),
            (&signals.edge, weights.edge),
            (&signals.geometry, weights.geometry),
            (&signals.statistical, weights.statistical),
        ];

        let scores = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            let score: f32 = votes
                .iter()
                .filter(|(signal, _)| signal.get_pixel(x as u32, y as u32)[0] != 0)
                .map(|(_, weight)| weight)
                .sum();
            score.min(1.0)
        });
        ProbabilityMap::new(scores)
    }

    fn color_signal(&self, image: &RgbImage) -> GrayImage {
        let ranges = &self.config.color_ranges;
        GrayImage::from_fn(image.width(), image.height(), |x, y| {
            let pixel = image.get_pixel(x, y).0;
            if ranges.iter().any(|range| range.contains(pixel)) {
                ON
            } else {
                OFF
            }
        })
    }

    fn edge_signal(&self, gray: &GrayImage) -> GrayImage {
        let gradients = sobel_gradients(gray);
        let threshold = self.config.edge_magnitude_threshold;
        GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
            if gradients.get_pixel(x, y)[0] >= threshold {
                ON
            } else {
                OFF
            }
        })
    }

    /// Pixels above the Otsu level of the image's own histogram.
    fn statistical_signal(&self, gray: &GrayImage) -> GrayImage {
        let (min, max) = gray
            .pixels()
            .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
        if max.saturating_sub(min) < self.config.min_contrast {
            return GrayImage::new(gray.width(), gray.height());
        }

        let level = otsu_level(gray);
        GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
            if gray.get_pixel(x, y)[0] > level {
                ON
            } else {
                OFF
            }
        })
    }

    /// Keep candidate components that are both large enough and line-like.
    fn geometry_signal(&self, color: &GrayImage, statistical: &GrayImage) -> GrayImage {
        let candidates = GrayImage::from_fn(color.width(), color.height(), |x, y| {
            if color.get_pixel(x, y)[0] != 0 || statistical.get_pixel(x, y)[0] != 0 {
                ON
            } else {
                OFF
            }
        });

        let labels = connected_components(&candidates, Connectivity::Eight, OFF);
        let label_count = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
        if label_count == 0 {
            return GrayImage::new(color.width(), color.height());
        }

        let mut moments = vec![Moments::default(); label_count + 1];
        for (x, y, label) in labels.enumerate_pixels() {
            if label[0] != 0 {
                moments[label[0] as usize].add(f64::from(x), f64::from(y));
            }
        }

        let min_area = f64::from(self.config.min_component_area);
        let min_elongation = f64::from(self.config.min_elongation);
        let accepted: Vec<bool> = moments
            .iter()
            .map(|m| m.count >= min_area.max(1.0) && m.elongation() >= min_elongation)
            .collect();

        GrayImage::from_fn(color.width(), color.height(), |x, y| {
            let label = labels.get_pixel(x, y)[0] as usize;
            if label != 0 && accepted[label] {
                ON
            } else {
                OFF
            }
        })
    }
}

/// Running first and second order moments of one component.
#[derive(Debug, Clone, Copy, Default)]
struct Moments {
    count: f64,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_xy: f64,
}

impl Moments {
    fn add(&mut self, x: f64, y: f64) {
        self.count += 1.0;
        self.sum_x += x;
        self.sum_y += y;
        self.sum_xx += x * x;
        self.sum_yy += y * y;
        self.sum_xy += x * y;
    }

    /// Square root of the ratio between the principal axes' variances.
    /// A straight one-pixel line is infinitely elongated, a disc is 1.
    fn elongation(&self) -> f64 {
        if self.count < 2.0 {
            return 1.0;
        }
        let n = self.count;
        let (mx, my) = (self.sum_x / n, self.sum_y / n);
        let cxx = self.sum_xx / n - mx * mx;
        let cyy = self.sum_yy / n - my * my;
        let cxy = self.sum_xy / n - mx * my;

        let half_trace = (cxx + cyy) / 2.0;
        let spread = (half_trace * half_trace - (cxx * cyy - cxy * cxy))
            .max(0.0)
            .sqrt();
        let major = half_trace + spread;
        let minor = (half_trace - spread).max(0.0);

        if minor <= f64::EPSILON {
            f64::INFINITY
        } else {
            (major / minor).sqrt()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    const DARK: Rgb<u8> = Rgb([25, 25, 25]);
    const LIGHT: Rgb<u8> = Rgb([220, 220, 220]);

    fn segmenter() -> HeuristicSegmenter {
        HeuristicSegmenter::new(HeuristicConfig::default())
    }

    #[test]
    fn test_black_image_scores_zero() {
        let image = RgbImage::from_pixel(64, 64, Rgb([0, 0, 0]));
        let map = segmenter().score(&image);
        assert_eq!(map.dimensions(), (64, 64));
        assert!(map.values().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_horizontal_line_is_flagged() {
        let mut image = RgbImage::from_pixel(120, 120, DARK);
        for y in 50..56 {
            for x in 0..120 {
                image.put_pixel(x, y, LIGHT);
            }
        }

        let map = segmenter().score(&image);
        assert!(map.get(60, 52) >= 0.9 - 1e-6);
        assert!(map.get(60, 20) < 0.3);
        assert!(map.get(60, 49) < 0.3);
    }

    #[test]
    fn test_blob_gets_no_geometry_vote() -> Result<()> {
        let mut image = RgbImage::from_pixel(120, 120, DARK);
        for y in 40..80 {
            for x in 40..80 {
                image.put_pixel(x, y, LIGHT);
            }
        }

        let signals = segmenter().signals(&image)?;
        assert_eq!(signals.color.get_pixel(60, 60)[0], 255);
        assert_eq!(signals.statistical.get_pixel(60, 60)[0], 255);
        assert_eq!(signals.geometry.get_pixel(60, 60)[0], 0);
        Ok(())
    }

    #[test]
    fn test_blob_stays_below_default_threshold() {
        let mut image = RgbImage::from_pixel(120, 120, DARK);
        for y in 40..80 {
            for x in 40..80 {
                image.put_pixel(x, y, LIGHT);
            }
        }

        let map = segmenter().score(&image);
        assert!(map.values().iter().all(|&v| v < 0.3));
        assert!(map.get(60, 60) > 0.0);
    }

    #[test]
    fn test_flat_light_image_stays_below_default_threshold() {
        let image = RgbImage::from_pixel(80, 80, Rgb([200, 200, 200]));
        let map = segmenter().score(&image);
        assert!(map.values().iter().all(|&v| v < 0.3));
    }

    #[test]
    fn test_internal_failure_degrades_to_empty_map() {
        let image = RgbImage::new(0, 0);
        let segmenter = segmenter();
        assert!(segmenter.try_score(&image).is_err());

        let map = segmenter.score(&image);
        assert_eq!(map.dimensions(), (0, 0));
        assert!(map.values().is_empty());
    }

    #[test]
    fn test_small_specks_get_no_geometry_vote() -> Result<()> {
        let mut image = RgbImage::from_pixel(120, 120, DARK);
        // a 1x20 stroke is line-like but below the default minimum area
        for x in 10..30 {
            image.put_pixel(x, 10, LIGHT);
        }

        let signals = segmenter().signals(&image)?;
        assert_eq!(signals.color.get_pixel(15, 10)[0], 255);
        assert_eq!(signals.geometry.get_pixel(15, 10)[0], 0);
        Ok(())
    }

    #[test]
    fn test_flat_image_has_no_statistical_signal() -> Result<()> {
        let image = RgbImage::from_pixel(50, 50, Rgb([200, 200, 200]));
        let signals = segmenter().signals(&image)?;
        assert!(signals.statistical.pixels().all(|p| p[0] == 0));
        assert!(signals.edge.pixels().all(|p| p[0] == 0));
        Ok(())
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let mut image = RgbImage::new(100, 100);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let v = ((x * 31 + y * 17) % 256) as u8;
            *pixel = Rgb([v, v.wrapping_add(40), 255 - v]);
        }
        let segmenter = segmenter();
        assert_eq!(segmenter.score(&image), segmenter.score(&image));
    }

    #[test]
    fn test_elongation() {
        let mut line = Moments::default();
        for x in 0..50 {
            line.add(f64::from(x), 3.0);
        }
        assert!(line.elongation().is_infinite());

        let mut square = Moments::default();
        for y in 0..10 {
            for x in 0..10 {
                square.add(f64::from(x), f64::from(y));
            }
        }
        assert!((square.elongation() - 1.0).abs() < 1e-9);

        let mut bar = Moments::default();
        for y in 0..4 {
            for x in 0..40 {
                bar.add(f64::from(x), f64::from(y));
            }
        }
        assert!(bar.elongation() > 3.0);
    }
}
