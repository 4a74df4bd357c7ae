//! Sewage infrastructure detection on aerial and satellite imagery.
//!
//! [`SewageDetector`] decodes an uploaded image, runs the learned U-Net
//! segmenter tile by tile when it is available (falling back to a
//! classical-vision detector when it is not), and reduces the result to a
//! binary mask plus coverage statistics.

pub mod config;
pub mod detector;
pub mod errors;
pub mod heuristic;
pub mod ingest;
pub mod mask;
pub mod model;
pub mod postprocess;
pub mod result;
pub mod supervisor;
pub mod traits;

pub mod mocks;

pub use config::DetectorConfig;
pub use detector::{Segmenter, SewageDetector};
pub use errors::{DetectionError, Result};
pub use mask::{BinaryMask, ProbabilityMap};
pub use model::{ModelHandle, OnnxModelLoader, OnnxSegmenter, PrimarySegmenter};
pub use result::{
    ConfidenceThreshold, Detection, DetectionResponse, DetectionResult, Dimensions, ModelType,
};
pub use supervisor::{ModelState, ModelSupervisor};
pub use traits::*;
