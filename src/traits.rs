use crate::errors::Result;
use ndarray::prelude::*;

/// Abstraction over the learned segmentation network.
///
/// Implementations are shared read-only across requests, so inference takes
/// `&self`; anything that needs exclusive access (an accelerator session)
/// must synchronize internally.
pub trait SegmentationModel: Send + Sync {
    /// Square input resolution the network was exported with.
    fn input_size(&self) -> u32;

    /// Run one batch. The input is a normalized tile tensor in the configured
    /// layout; the output has the same layout with a single channel of scores.
    fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>>;
}

/// Builds the model the supervisor hands out.
///
/// Kept separate from [`SegmentationModel`] so the supervisor can be tested
/// with loaders that fail, stall or count their calls.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<Box<dyn SegmentationModel>>;

    /// Short label for logs, e.g. the weight file.
    fn describe(&self) -> String;
}

impl<L: ModelLoader + ?Sized> ModelLoader for Box<L> {
    fn load(&self) -> Result<Box<dyn SegmentationModel>> {
        (**self).load()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
