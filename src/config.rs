use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{DetectionError, Result};

/// Every tunable of the detection engine in one place.
///
/// Loaded from TOML with [`DetectorConfig::from_toml_file`]; any section or
/// field left out keeps its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectorConfig {
    pub model: ModelConfig,
    pub ingest: IngestConfig,
    pub supervisor: SupervisorConfig,
    pub postprocess: PostProcessConfig,
    pub heuristic: HeuristicConfig,
    /// Threshold used by the CLI when none is given on the command line.
    pub default_confidence_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[batch, height, width, channels]`, as exported from Keras.
    Nhwc,
    /// `[batch, channels, height, width]`, as exported from PyTorch.
    Nchw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    /// The graph already ends in a sigmoid.
    Sigmoid,
    /// The graph emits raw scores; a sigmoid is applied after inference.
    Logits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// ONNX export of the U-Net weights.
    pub weights_path: PathBuf,
    pub layout: TensorLayout,
    pub output_activation: OutputActivation,
    pub device_id: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    pub max_payload_bytes: usize,
    pub min_dimension: u32,
    pub max_dimension: u32,
    /// Native input resolution of the model; images larger than this are tiled.
    pub tile_size: u32,
    /// Pixels shared by neighbouring tiles.
    pub tile_overlap: u32,
    pub pixel_scale: f32,
    pub pixel_offset: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Seconds to wait before a failed model load may be retried. `None` keeps
    /// the model unavailable for the life of the process.
    pub retry_cooldown_secs: Option<u64>,
    /// Consecutive inference failures before the model is taken out of service.
    pub failure_threshold: u32,
    pub inference_timeout_ms: u64,
    /// Upper bound on tiles of one image processed at the same time.
    pub tile_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostProcessConfig {
    /// Square (L-infinity) erosion radius; 1 is a 3x3 kernel, 0 disables.
    /// Any radius removes structures up to `2 * radius` pixels wide, so it is
    /// off by default.
    pub erosion_radius: u8,
    /// Square (L-infinity) dilation radius; 1 is a 3x3 kernel, 0 disables.
    pub dilation_radius: u8,
    /// Share of the image that must be flagged before a detection is declared.
    pub noise_floor: f64,
}

/// Inclusive RGB box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorRange {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl ColorRange {
    pub const fn contains(&self, [r, g, b]: [u8; 3]) -> bool {
        r >= self.lower[0]
            && r <= self.upper[0]
            && g >= self.lower[1]
            && g <= self.upper[1]
            && b >= self.lower[2]
            && b <= self.upper[2]
    }
}

/// Weights of the four fallback signals. Normalized to sum to one before use.
///
/// With the defaults only the geometry signal can lift a pixel to 0.3 or
/// above; color, edge and statistics refine the score of line-like pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SignalWeights {
    pub color: f32,
    pub edge: f32,
    pub geometry: f32,
    pub statistical: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeuristicConfig {
    /// Colors of exposed concrete, manhole covers and pipe markings.
    pub color_ranges: Vec<ColorRange>,
    /// Sobel gradient magnitude that counts as a structure boundary.
    pub edge_magnitude_threshold: u16,
    pub min_component_area: u32,
    /// Ratio of principal axes a component needs to count as line-like.
    pub min_elongation: f32,
    /// Below this grey-level spread the image is treated as featureless.
    pub min_contrast: u8,
    pub weights: SignalWeights,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            ingest: IngestConfig::default(),
            supervisor: SupervisorConfig::default(),
            postprocess: PostProcessConfig::default(),
            heuristic: HeuristicConfig::default(),
            default_confidence_threshold: 0.3,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            weights_path: PathBuf::from("models/sewage_unet.onnx"),
            layout: TensorLayout::Nhwc,
            output_activation: OutputActivation::Sigmoid,
            device_id: 0,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 16 * 1024 * 1024,
            min_dimension: 100,
            max_dimension: 10_000,
            tile_size: 128,
            tile_overlap: 16,
            pixel_scale: 1.0 / 255.0,
            pixel_offset: 0.0,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_cooldown_secs: None,
            failure_threshold: 3,
            inference_timeout_ms: 5_000,
            tile_workers: std::thread::available_parallelism().map_or(4, |n| n.get()),
        }
    }
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            erosion_radius: 0,
            dilation_radius: 1,
            noise_floor: 0.001,
        }
    }
}

impl Default for SignalWeights {
    fn default() -> Self {
        // the three supporting signals together stay below a 0.3 threshold
        Self {
            color: 0.08,
            edge: 0.08,
            geometry: 0.76,
            statistical: 0.08,
        }
    }
}

impl SignalWeights {
    pub fn total(&self) -> f32 {
        self.color + self.edge + self.geometry + self.statistical
    }

    /// Weights scaled to sum to one.
    pub fn normalized(&self) -> Self {
        let total = self.total();
        Self {
            color: self.color / total,
            edge: self.edge / total,
            geometry: self.geometry / total,
            statistical: self.statistical / total,
        }
    }
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            color_ranges: vec![
                // concrete channels and manhole covers
                ColorRange {
                    lower: [170, 170, 170],
                    upper: [255, 255, 255],
                },
                // rust-brown pipe runs and discharge stains
                ColorRange {
                    lower: [120, 60, 20],
                    upper: [190, 120, 80],
                },
            ],
            edge_magnitude_threshold: 120,
            min_component_area: 64,
            min_elongation: 3.0,
            min_contrast: 16,
            weights: SignalWeights::default(),
        }
    }
}

impl SupervisorConfig {
    pub const fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn retry_cooldown(&self) -> Option<Duration> {
        self.retry_cooldown_secs.map(Duration::from_secs)
    }
}

impl DetectorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| DetectionError::FileSystem {
            path: path.to_path_buf(),
            operation: "read configuration".to_string(),
            source: e,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let ingest = &self.ingest;
        if ingest.tile_size == 0 {
            return Err(invalid("ingest.tile_size", "must be positive"));
        }
        if ingest.tile_overlap >= ingest.tile_size {
            return Err(invalid(
                "ingest.tile_overlap",
                "must be smaller than ingest.tile_size",
            ));
        }
        if ingest.min_dimension == 0 || ingest.min_dimension > ingest.max_dimension {
            return Err(invalid(
                "ingest.min_dimension",
                "must be positive and not above ingest.max_dimension",
            ));
        }
        if ingest.max_payload_bytes == 0 {
            return Err(invalid("ingest.max_payload_bytes", "must be positive"));
        }
        if !ingest.pixel_scale.is_finite() || !ingest.pixel_offset.is_finite() {
            return Err(invalid("ingest.pixel_scale", "scale and offset must be finite"));
        }

        let supervisor = &self.supervisor;
        if supervisor.failure_threshold == 0 {
            return Err(invalid("supervisor.failure_threshold", "must be at least 1"));
        }
        if supervisor.inference_timeout_ms == 0 {
            return Err(invalid("supervisor.inference_timeout_ms", "must be positive"));
        }
        if supervisor.tile_workers == 0 {
            return Err(invalid("supervisor.tile_workers", "must be at least 1"));
        }

        if !(0.0..1.0).contains(&self.postprocess.noise_floor) {
            return Err(invalid("postprocess.noise_floor", "must be in [0, 1)"));
        }

        let weights = &self.heuristic.weights;
        let all = [
            weights.color,
            weights.edge,
            weights.geometry,
            weights.statistical,
        ];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) || weights.total() <= 0.0 {
            return Err(invalid(
                "heuristic.weights",
                "must be non-negative with a positive sum",
            ));
        }
        if let Some(range) = self
            .heuristic
            .color_ranges
            .iter()
            .find(|r| (0..3).any(|c| r.lower[c] > r.upper[c]))
        {
            return Err(invalid(
                "heuristic.color_ranges",
                &format!("lower bound above upper bound in {range:?}"),
            ));
        }
        if !self.heuristic.min_elongation.is_finite() || self.heuristic.min_elongation < 1.0 {
            return Err(invalid("heuristic.min_elongation", "must be at least 1.0"));
        }

        if !(self.default_confidence_threshold > 0.0 && self.default_confidence_threshold < 1.0) {
            return Err(invalid(
                "default_confidence_threshold",
                "must be in the open interval (0, 1)",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> DetectionError {
    DetectionError::Validation {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
