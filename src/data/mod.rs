/// Data loading modules: CIFAR-10 storage, augmentation, batch iteration
pub mod augment;
pub mod cifar;
pub mod loader;

pub use augment::{AugmentConfig, TransformPipeline};
pub use cifar::{CifarDataset, IMAGE_CHANNELS, IMAGE_DIM, NUM_CLASSES, SPLIT_SEED};
pub use loader::CifarLoader;

use candle_core::{Device, Result, Tensor};

/// Per-channel CIFAR-10 training-set statistics used for input normalization.
pub const CIFAR_MEAN: [f32; 3] = [0.4914, 0.4822, 0.4465];
pub const CIFAR_STD: [f32; 3] = [0.2471, 0.2435, 0.2616];

/// Generic data loader trait
///
/// The epoch loops consume batches as a blocking synchronous sequence; how a
/// loader produces them (pre-loading, augmentation, shuffling) is its own
/// business.
pub trait BatchLoader {
    /// Get next batch of (images, labels) tensors
    fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>>;

    /// Reset loader for new epoch
    fn reset(&mut self);

    /// Get total number of batches
    fn num_batches(&self) -> usize;
}
