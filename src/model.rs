use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::{
    config::{ModelConfig, OutputActivation, TensorLayout},
    errors::{DetectionError, Result},
    ingest::Tile,
    mask::ProbabilityMap,
    traits::{ModelLoader, SegmentationModel},
};
use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;
use tracing::{debug, info};

/// U-Net exported to ONNX, run through ONNX Runtime.
///
/// The session sits behind a mutex: every request shares one model, and the
/// accelerator it runs on only takes one call at a time.
pub struct OnnxSegmenter {
    pub image_size: u32,
    layout: TensorLayout,
    input_name: String,
    output_name: String,
    session: Mutex<Session>,
}

fn load_error(operation: impl Into<String>, err: impl std::fmt::Display) -> DetectionError {
    DetectionError::unavailable(operation, err.to_string())
}

impl OnnxSegmenter {
    pub fn new(config: &ModelConfig, image_size: u32) -> Result<Self> {
        let model_path = &config.weights_path;
        if !model_path.is_file() {
            return Err(load_error(
                "weight artifact lookup",
                format!("no model file at {}", model_path.display()),
            ));
        }

        let started = Instant::now();
        let mut session = SessionBuilder::new()
            .map_err(|e| load_error("session builder initialization", e))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(config.device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(config.device_id)
                    .build(),
            ])
            .map_err(|e| load_error("execution provider registration", e))?
            .with_memory_pattern(true)
            .map_err(|e| load_error("memory pattern configuration", e))?
            .commit_from_file(model_path)
            .map_err(|e| load_error(format!("model load: {}", model_path.display()), e))?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| load_error("model input lookup", "model declares no inputs"))?;
        let output = session
            .outputs
            .first()
            .ok_or_else(|| load_error("model output lookup", "model declares no outputs"))?;
        let input_name = input.name.clone();
        let output_name = output.name.clone();

        // dynamic axes are reported as -1 and accept any tile size
        if let Some(shape) = input.input_type.tensor_shape() {
            let (height_axis, width_axis) = match config.layout {
                TensorLayout::Nhwc => (1, 2),
                TensorLayout::Nchw => (2, 3),
            };
            for axis in [height_axis, width_axis] {
                match shape.get(axis) {
                    Some(&dim) if dim > 0 && dim != i64::from(image_size) => {
                        return Err(load_error(
                            "model input shape check",
                            format!(
                                "model expects {dim}px on axis {axis}, tiles are {image_size}px"
                            ),
                        ));
                    }
                    None => {
                        return Err(load_error(
                            "model input shape check",
                            format!("expected a 4D input, got {} axes", shape.len()),
                        ));
                    }
                    _ => {}
                }
            }
        }

        // warm-up run; also proves the graph accepts our tensor layout
        let size = image_size as usize;
        let data = match config.layout {
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, size, size, 3)),
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, size, size)),
        };
        session
            .run(ort::inputs![input_name.as_str() => TensorRef::from_array_view(&data)
                .map_err(|e| load_error("warm-up tensor creation", e))?])
            .map_err(|e| load_error("warm-up run", e))?;

        info!(
            path = %model_path.display(),
            input = %input_name,
            output = %output_name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "segmentation model loaded"
        );

        Ok(Self {
            image_size,
            layout: config.layout,
            input_name,
            output_name,
            session: Mutex::new(session),
        })
    }
}

impl SegmentationModel for OnnxSegmenter {
    fn input_size(&self) -> u32 {
        self.image_size
    }

    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut binding = self.session.lock();
        let outputs = binding.run(
            ort::inputs![self.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())?],
        )?;
        let scores = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned();
        debug!(layout = ?self.layout, shape = ?scores.shape(), "model inference finished");
        Ok(scores)
    }
}

/// Production loader: ONNX weights from the configured path.
pub struct OnnxModelLoader {
    config: ModelConfig,
    tile_size: u32,
}

impl OnnxModelLoader {
    pub fn new(config: ModelConfig, tile_size: u32) -> Self {
        Self { config, tile_size }
    }

    pub fn weights_path(&self) -> &Path {
        &self.config.weights_path
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self) -> Result<Box<dyn SegmentationModel>> {
        Ok(Box::new(OnnxSegmenter::new(&self.config, self.tile_size)?))
    }

    fn describe(&self) -> String {
        self.config.weights_path.display().to_string()
    }
}

/// A loaded, shareable model. Cloning is cheap.
pub type ModelHandle = Arc<dyn SegmentationModel>;

/// Primary strategy: the learned model applied tile by tile.
#[derive(Clone)]
pub struct PrimarySegmenter {
    handle: ModelHandle,
    layout: TensorLayout,
    activation: OutputActivation,
}

impl PrimarySegmenter {
    pub fn new(handle: ModelHandle, layout: TensorLayout, activation: OutputActivation) -> Self {
        Self {
            handle,
            layout,
            activation,
        }
    }

    pub fn input_size(&self) -> u32 {
        self.handle.input_size()
    }

    /// Probability map for the valid (unpadded) region of `tile`.
    ///
    /// Deterministic for fixed weights and input. Any runtime problem, a
    /// wrongly shaped output or a non-finite score is reported as a
    /// [`DetectionError::ModelInference`] so the caller can fall back.
    pub fn infer(&self, tile: &Tile) -> Result<ProbabilityMap> {
        let scores = self.handle.predict(tile.tensor.view())?;

        let size = tile.tile_size as usize;
        let expected = match self.layout {
            TensorLayout::Nhwc => [1, size, size, 1],
            TensorLayout::Nchw => [1, 1, size, size],
        };
        if scores.shape() != expected {
            return Err(DetectionError::inference(
                "output shape check",
                format!("expected {expected:?}, model produced {:?}", scores.shape()),
            ));
        }

        let plane = match self.layout {
            TensorLayout::Nhwc => scores.index_axis_move(Axis(3), 0).index_axis_move(Axis(0), 0),
            TensorLayout::Nchw => scores.index_axis_move(Axis(1), 0).index_axis_move(Axis(0), 0),
        };
        if plane.iter().any(|v| !v.is_finite()) {
            return Err(DetectionError::inference(
                "output validation",
                "model produced non-finite scores",
            ));
        }

        let (width, height) = (tile.rect.width as usize, tile.rect.height as usize);
        let valid = plane.slice(s![..height, ..width]);
        let probabilities = match self.activation {
            OutputActivation::Sigmoid => valid.mapv(|v| v.clamp(0.0, 1.0)),
            OutputActivation::Logits => valid.mapv(sigmoid),
        };
        ProbabilityMap::new(probabilities)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::ingest::{InputImage, Normalizer, TileGrid};
    use crate::mocks::{FailingModel, MockSegmentationModel};
    use image::{Rgb, RgbImage};
    use std::path::PathBuf;

    fn single_tile(layout: TensorLayout, width: u32, height: u32, value: u8) -> Tile {
        let image = InputImage {
            pixels: RgbImage::from_pixel(width, height, Rgb([value, value, value])),
            format: image::ImageFormat::Png,
            byte_size: 0,
        };
        let grid = TileGrid::plan(width, height, 128, 16);
        let normalizer = Normalizer::from_config(&IngestConfig::default(), layout);
        Tile::extract(&image, grid.rects()[0], 128, &normalizer).unwrap()
    }

    #[test]
    fn test_infer_crops_padding() -> Result<()> {
        for layout in [TensorLayout::Nhwc, TensorLayout::Nchw] {
            let segmenter = PrimarySegmenter::new(
                Arc::new(MockSegmentationModel::new(128)),
                layout,
                OutputActivation::Sigmoid,
            );
            let tile = single_tile(layout, 100, 110, 255);

            let map = segmenter.infer(&tile)?;
            assert_eq!(map.dimensions(), (100, 110));
            assert!(map.values().iter().all(|&v| (v - 1.0).abs() < 1e-6));
        }
        Ok(())
    }

    #[test]
    fn test_logits_go_through_sigmoid() -> Result<()> {
        let segmenter = PrimarySegmenter::new(
            Arc::new(MockSegmentationModel::new(128)),
            TensorLayout::Nhwc,
            OutputActivation::Logits,
        );
        let tile = single_tile(TensorLayout::Nhwc, 100, 100, 0);

        let map = segmenter.infer(&tile)?;
        assert!(map.values().iter().all(|&v| (v - 0.5).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_wrong_output_shape_is_an_inference_error() {
        let segmenter = PrimarySegmenter::new(
            Arc::new(MockSegmentationModel::new(128)),
            TensorLayout::Nchw,
            OutputActivation::Sigmoid,
        );
        // NHWC tensor fed to a segmenter expecting NCHW output
        let tile = single_tile(TensorLayout::Nhwc, 100, 100, 10);

        let err = segmenter.infer(&tile).unwrap_err();
        assert!(matches!(err, DetectionError::ModelInference { .. }));
    }

    #[test]
    fn test_runtime_failure_is_an_inference_error() {
        let segmenter = PrimarySegmenter::new(
            Arc::new(FailingModel::new(128)),
            TensorLayout::Nhwc,
            OutputActivation::Sigmoid,
        );
        let tile = single_tile(TensorLayout::Nhwc, 100, 100, 10);
        assert!(matches!(
            segmenter.infer(&tile),
            Err(DetectionError::ModelInference { .. })
        ));
    }

    #[test]
    fn test_missing_weights_fail_to_load() {
        let config = ModelConfig {
            weights_path: PathBuf::from("does/not/exist.onnx"),
            ..ModelConfig::default()
        };
        let loader = OnnxModelLoader::new(config, 128);
        assert!(matches!(
            loader.load(),
            Err(DetectionError::ModelUnavailable { .. })
        ));
        assert_eq!(loader.describe(), "does/not/exist.onnx");
    }

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(20.0) > 0.999);
        assert!(sigmoid(-20.0) < 0.001);
    }
}
