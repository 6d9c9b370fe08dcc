/// Batch iteration over a split of the CIFAR-10 corpus
use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

use super::augment::TransformPipeline;
use super::cifar::{CifarDataset, IMAGE_CHANNELS, IMAGE_DIM};
use super::BatchLoader;

/// Data loader over an index subset of a [`CifarDataset`]
///
/// Applies its transform pipeline per sample and assembles
/// `([B, 3, 32, 32] F32, [B] U32)` tensor pairs. Shuffling (when enabled)
/// reorders the index set from the loader's own seeded RNG, once at
/// construction and once per [`BatchLoader::reset`].
pub struct CifarLoader {
    dataset: Arc<CifarDataset>,
    indices: Vec<usize>,
    pipeline: TransformPipeline,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    cursor: usize,
}

impl CifarLoader {
    pub fn new(
        dataset: Arc<CifarDataset>,
        indices: Vec<usize>,
        pipeline: TransformPipeline,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
    ) -> Self {
        let mut loader = Self {
            dataset,
            indices,
            pipeline,
            batch_size,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            cursor: 0,
        };
        if loader.shuffle {
            loader.indices.shuffle(&mut loader.rng);
        }
        loader
    }

    /// Number of samples this loader iterates
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

impl BatchLoader for CifarLoader {
    fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>> {
        if self.cursor >= self.indices.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.cursor..end];
        let actual_batch_size = batch_indices.len();

        let mut image_data = Vec::with_capacity(actual_batch_size * IMAGE_CHANNELS * IMAGE_DIM * IMAGE_DIM);
        let mut label_data = Vec::with_capacity(actual_batch_size);

        for &idx in batch_indices {
            let chw = self.dataset.image(idx).to_vec();
            image_data.extend(self.pipeline.apply(&chw, &mut self.rng));
            label_data.push(self.dataset.label(idx) as u32);
        }

        self.cursor = end;

        let images = Tensor::from_vec(
            image_data,
            (actual_batch_size, IMAGE_CHANNELS, IMAGE_DIM, IMAGE_DIM),
            device,
        )?;
        let labels = Tensor::from_vec(label_data, actual_batch_size, device)?
            .to_dtype(DType::U32)?;

        Ok(Some((images, labels)))
    }

    fn reset(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    fn num_batches(&self) -> usize {
        (self.indices.len() + self.batch_size - 1) / self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::cifar::IMAGE_BYTES;
    use ndarray::Array2;

    fn synthetic_dataset(n: usize) -> Arc<CifarDataset> {
        let pixels: Vec<u8> = (0..n * IMAGE_BYTES).map(|i| (i % 256) as u8).collect();
        let labels: Vec<u8> = (0..n).map(|i| (i % 10) as u8).collect();
        let images = Array2::from_shape_vec((n, IMAGE_BYTES), pixels).unwrap();
        Arc::new(CifarDataset::from_raw(images, labels).unwrap())
    }

    #[test]
    fn test_batch_shapes_and_remainder() -> Result<()> {
        let dataset = synthetic_dataset(10);
        let indices: Vec<usize> = (0..10).collect();
        let mut loader = CifarLoader::new(
            dataset,
            indices,
            TransformPipeline::eval(),
            4,
            false,
            0,
        );
        let device = Device::Cpu;

        assert_eq!(loader.num_batches(), 3);

        let (images, labels) = loader.next_batch(&device)?.unwrap();
        assert_eq!(images.dims(), &[4, 3, 32, 32]);
        assert_eq!(images.dtype(), DType::F32);
        assert_eq!(labels.dims(), &[4]);
        assert_eq!(labels.dtype(), DType::U32);

        loader.next_batch(&device)?.unwrap();
        let (last_images, last_labels) = loader.next_batch(&device)?.unwrap();
        assert_eq!(last_images.dims(), &[2, 3, 32, 32]);
        assert_eq!(last_labels.to_vec1::<u32>()?, vec![8, 9]);

        assert!(loader.next_batch(&device)?.is_none());
        Ok(())
    }

    #[test]
    fn test_reset_without_shuffle_repeats_order() -> Result<()> {
        let dataset = synthetic_dataset(6);
        let indices: Vec<usize> = (0..6).collect();
        let mut loader = CifarLoader::new(
            dataset,
            indices,
            TransformPipeline::eval(),
            3,
            false,
            0,
        );
        let device = Device::Cpu;

        let (_, first) = loader.next_batch(&device)?.unwrap();
        loader.reset();
        let (_, again) = loader.next_batch(&device)?.unwrap();
        assert_eq!(first.to_vec1::<u32>()?, again.to_vec1::<u32>()?);
        Ok(())
    }

    #[test]
    fn test_shuffle_covers_all_labels() -> Result<()> {
        let dataset = synthetic_dataset(10);
        let indices: Vec<usize> = (0..10).collect();
        let mut loader = CifarLoader::new(
            dataset,
            indices,
            TransformPipeline::eval(),
            10,
            true,
            42,
        );
        let device = Device::Cpu;

        let (_, labels) = loader.next_batch(&device)?.unwrap();
        let mut seen = labels.to_vec1::<u32>()?;
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<u32>>());
        Ok(())
    }
}
