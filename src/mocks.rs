//! Test doubles for the model seams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ndarray::prelude::*;
use parking_lot::Mutex;

use crate::errors::{DetectionError, Result};
use crate::traits::{ModelLoader, SegmentationModel};

/// Pixel-local model: the score of a pixel is the mean of its normalized
/// channels. Works with either tensor layout.
#[derive(Debug, Clone)]
pub struct MockSegmentationModel {
    pub image_size: u32,
}

impl MockSegmentationModel {
    pub const fn new(image_size: u32) -> Self {
        Self { image_size }
    }
}

impl SegmentationModel for MockSegmentationModel {
    fn input_size(&self) -> u32 {
        self.image_size
    }

    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        // NHWC tensors end in the three color channels
        let channel_axis = if tensor.shape()[3] == 3 { Axis(3) } else { Axis(1) };
        let mean = tensor
            .mean_axis(channel_axis)
            .ok_or_else(|| DetectionError::inference("mock predict", "empty channel axis"))?;
        Ok(mean.insert_axis(channel_axis))
    }
}

/// Model whose every inference fails.
#[derive(Debug, Clone)]
pub struct FailingModel {
    pub image_size: u32,
}

impl FailingModel {
    pub const fn new(image_size: u32) -> Self {
        Self { image_size }
    }
}

impl SegmentationModel for FailingModel {
    fn input_size(&self) -> u32 {
        self.image_size
    }

    fn predict(&self, _tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        Err(DetectionError::inference(
            "mock predict",
            "simulated runtime failure",
        ))
    }
}

/// Pixel-local model that takes `delay` per call and, like a single
/// accelerator session, runs one call at a time.
#[derive(Debug)]
pub struct SlowModel {
    inner: MockSegmentationModel,
    delay: Duration,
    session: Mutex<()>,
}

impl SlowModel {
    pub fn new(image_size: u32, delay: Duration) -> Self {
        Self {
            inner: MockSegmentationModel::new(image_size),
            delay,
            session: Mutex::new(()),
        }
    }
}

impl SegmentationModel for SlowModel {
    fn input_size(&self) -> u32 {
        self.inner.input_size()
    }

    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        let _session = self.session.lock();
        std::thread::sleep(self.delay);
        self.inner.predict(tensor)
    }
}

type ModelFactory = dyn Fn() -> Box<dyn SegmentationModel> + Send + Sync;

/// Configurable loader: builds any model, optionally slowly, optionally
/// failing or panicking first.
pub struct MockLoader {
    factory: Arc<ModelFactory>,
    delay: Duration,
    fail_first: usize,
    panics: bool,
    calls: Arc<AtomicUsize>,
}

impl MockLoader {
    /// Loads a [`MockSegmentationModel`].
    pub fn new(image_size: u32) -> Self {
        Self::with_model(move || Box::new(MockSegmentationModel::new(image_size)))
    }

    pub fn with_model<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn SegmentationModel> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            delay: Duration::ZERO,
            fail_first: 0,
            panics: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A loader that never succeeds, like a missing weight file.
    pub fn failing() -> Self {
        Self::new(128).fail_first(usize::MAX)
    }

    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Self::new(128)
        }
    }

    pub fn fail_first(mut self, attempts: usize) -> Self {
        self.fail_first = attempts;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Shared counter of `load` calls; stays valid after the loader is moved.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl ModelLoader for MockLoader {
    fn load(&self) -> Result<Box<dyn SegmentationModel>> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.panics {
            panic!("simulated loader panic");
        }
        if attempt < self.fail_first {
            return Err(DetectionError::unavailable(
                "mock load",
                format!("simulated load failure on attempt {}", attempt + 1),
            ));
        }
        Ok((self.factory)())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
