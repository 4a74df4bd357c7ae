use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the detection engine.
///
/// Only [`DetectionError::InvalidImage`], [`DetectionError::Validation`] and
/// [`DetectionError::PostProcessing`] ever leave [`crate::SewageDetector::detect`].
/// Model availability and inference failures are absorbed by the engine and
/// reported through logs and the `model_type` of the result.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Invalid image: {reason}")]
    InvalidImage { reason: String },

    #[error("Model unavailable: {operation} failed")]
    ModelUnavailable {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Model inference error: {operation} failed")]
    ModelInference {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Model inference exceeded its deadline of {after:?}")]
    InferenceTimeout { after: Duration },

    #[error("Post-processing invariant violated in {stage}: {reason}")]
    PostProcessing { stage: String, reason: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, DetectionError>;

impl DetectionError {
    pub fn invalid_image(reason: impl Into<String>) -> Self {
        Self::InvalidImage {
            reason: reason.into(),
        }
    }

    pub fn inference(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason: String = reason.into();
        Self::ModelInference {
            operation: operation.into(),
            source: reason.into(),
        }
    }

    pub fn unavailable(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason: String = reason.into();
        Self::ModelUnavailable {
            operation: operation.into(),
            source: reason.into(),
        }
    }

    pub fn post_processing(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PostProcessing {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// True for errors the caller caused by sending bad input.
    pub const fn is_input_rejection(&self) -> bool {
        matches!(self, Self::InvalidImage { .. } | Self::Validation { .. })
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should construct
/// `DetectionError::FileSystem` directly instead.
impl From<std::io::Error> for DetectionError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Decoding happens only during ingestion, so image crate errors are input errors.
/// Mask encoding maps its own failures explicitly.
impl From<image::ImageError> for DetectionError {
    fn from(err: image::ImageError) -> Self {
        Self::InvalidImage {
            reason: err.to_string(),
        }
    }
}

/// Convert ONNX Runtime errors to inference errors.
impl From<ort::Error> for DetectionError {
    fn from(err: ort::Error) -> Self {
        Self::ModelInference {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come out of tensor handling around the model, so they count as
/// inference failures and send the tile to the fallback detector.
impl From<ndarray::ShapeError> for DetectionError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::ModelInference {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<toml::de::Error> for DetectionError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_rejection_classification() {
        assert!(DetectionError::invalid_image("empty payload").is_input_rejection());
        assert!(DetectionError::Validation {
            field: "confidence_threshold".to_string(),
            reason: "must be in (0, 1)".to_string(),
        }
        .is_input_rejection());
        assert!(!DetectionError::post_processing("stitch", "uncovered pixel").is_input_rejection());
        assert!(!DetectionError::inference("run", "boom").is_input_rejection());
    }

    #[test]
    fn test_display_carries_context() {
        let err = DetectionError::inference("session run", "device lost");
        assert_eq!(err.to_string(), "Model inference error: session run failed");
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("device lost"));
    }
}
