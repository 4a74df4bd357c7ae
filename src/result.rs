use serde::{Deserialize, Serialize};

use crate::errors::{DetectionError, Result};
use crate::mask::BinaryMask;

/// Which strategy produced the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelType {
    Primary,
    Fallback,
}

/// Caller-supplied confidence threshold, guaranteed to lie in `(0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct ConfidenceThreshold(f32);

impl ConfidenceThreshold {
    pub fn new(value: f32) -> Result<Self> {
        if value > 0.0 && value < 1.0 {
            Ok(Self(value))
        } else {
            Err(DetectionError::Validation {
                field: "confidence_threshold".to_string(),
                reason: format!("{value} is outside the open interval (0, 1)"),
            })
        }
    }

    pub const fn get(self) -> f32 {
        self.0
    }
}

impl TryFrom<f32> for ConfidenceThreshold {
    type Error = DetectionError;

    fn try_from(value: f32) -> Result<Self> {
        Self::new(value)
    }
}

/// Summary statistics of one detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub sewage_lines_detected: bool,
    pub coverage_percentage: f64,
    pub detected_pixels: u64,
    pub total_pixels: u64,
    pub confidence_threshold: f32,
    pub model_type: ModelType,
}

impl DetectionResult {
    /// Aggregate `mask`, which must cover an image of `dimensions`.
    ///
    /// A detection is declared once more than `noise_floor` of the image is
    /// flagged, so a handful of stray pixels never counts.
    pub fn from_mask(
        mask: &BinaryMask,
        dimensions: (u32, u32),
        threshold: ConfidenceThreshold,
        model_type: ModelType,
        noise_floor: f64,
    ) -> Result<Self> {
        if mask.dimensions() != dimensions {
            return Err(DetectionError::post_processing(
                "aggregation",
                format!(
                    "mask is {:?} but the image is {dimensions:?}",
                    mask.dimensions()
                ),
            ));
        }

        let total_pixels = mask.total_pixels();
        if total_pixels == 0 {
            return Err(DetectionError::post_processing(
                "aggregation",
                "image has no pixels",
            ));
        }
        let detected_pixels = mask.detected_pixels();

        let ratio = detected_pixels as f64 / total_pixels as f64;
        Ok(Self {
            sewage_lines_detected: ratio > noise_floor,
            coverage_percentage: round2(ratio * 100.0),
            detected_pixels,
            total_pixels,
            confidence_threshold: threshold.get(),
            model_type,
        })
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Everything a detection produces.
#[derive(Debug, Clone)]
pub struct Detection {
    pub result: DetectionResult,
    pub mask: BinaryMask,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Response returned to the upload client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub success: bool,
    pub original_image: String,
    pub segmentation_mask: String,
    pub message: String,
    pub detection_results: DetectionResult,
    pub dimensions: Dimensions,
}

impl DetectionResponse {
    pub const SUCCESS_MESSAGE: &'static str = "Image uploaded and processed successfully";

    /// `original_image` and `segmentation_mask` are wherever the storage
    /// layer put the two files.
    pub fn new(
        detection: &Detection,
        original_image: impl Into<String>,
        segmentation_mask: impl Into<String>,
    ) -> Self {
        Self {
            success: true,
            original_image: original_image.into(),
            segmentation_mask: segmentation_mask.into(),
            message: Self::SUCCESS_MESSAGE.to_string(),
            detection_results: detection.result.clone(),
            dimensions: Dimensions {
                width: detection.width,
                height: detection.height,
            },
        }
    }
}
