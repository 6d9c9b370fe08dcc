/// CIFAR-10 dataset loader for the binary batch format (`data_batch_*.bin`)
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};

/// Spatial side length of a CIFAR-10 image.
pub const IMAGE_DIM: usize = 32;
/// Color channels per image.
pub const IMAGE_CHANNELS: usize = 3;
/// Pixel bytes per image, channel-planar (CHW) as stored on disk.
pub const IMAGE_BYTES: usize = IMAGE_CHANNELS * IMAGE_DIM * IMAGE_DIM;
/// Number of classes.
pub const NUM_CLASSES: usize = 10;

/// Each on-disk record is one label byte followed by the pixel bytes.
const RECORD_BYTES: usize = 1 + IMAGE_BYTES;

/// Seed for the train/validation partition. Fixed so that a run resumed from
/// a checkpoint reproduces the same split and never sees validation images in
/// its training stream.
pub const SPLIT_SEED: u64 = 2_766_521;

/// CIFAR-10 images and labels loaded into memory
pub struct CifarDataset {
    images: Array2<u8>, // [N, IMAGE_BYTES], rows are CHW-planar pixels
    labels: Vec<u8>,    // [N], values in [0, NUM_CLASSES)
}

impl CifarDataset {
    /// Load the training corpus from a directory containing `data_batch_*.bin`
    pub fn from_directory<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading CIFAR-10 dataset from: {:?}", dir);

        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("data_batch_") && n.ends_with(".bin"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(crate::TrainError::Data(format!(
                "no data_batch_*.bin files found in {:?}",
                dir
            )));
        }

        Self::from_files(&files)
    }

    /// Load from an explicit list of binary batch files
    pub fn from_files(paths: &[PathBuf]) -> crate::Result<Self> {
        let mut pixels = Vec::new();
        let mut labels = Vec::new();

        for path in paths {
            let bytes = fs::read(path)?;
            parse_records(&bytes, &mut pixels, &mut labels).map_err(|msg| {
                crate::TrainError::Data(format!("{:?}: {}", path, msg))
            })?;
            log::info!("Loaded {:?}: {} records so far", path, labels.len());
        }

        let num_examples = labels.len();
        let images = Array2::from_shape_vec((num_examples, IMAGE_BYTES), pixels)
            .map_err(|e| crate::TrainError::Data(format!("bad image table shape: {}", e)))?;

        log::info!("Dataset loaded: {} examples", num_examples);

        Ok(Self { images, labels })
    }

    /// Build from an in-memory table. Rows must be CHW-planar pixel bytes.
    pub fn from_raw(images: Array2<u8>, labels: Vec<u8>) -> crate::Result<Self> {
        if images.nrows() != labels.len() {
            return Err(crate::TrainError::Data(format!(
                "image/label count mismatch: {} != {}",
                images.nrows(),
                labels.len()
            )));
        }
        if images.ncols() != IMAGE_BYTES {
            return Err(crate::TrainError::Data(format!(
                "expected {} pixel bytes per image, got {}",
                IMAGE_BYTES,
                images.ncols()
            )));
        }
        if let Some(&label) = labels.iter().find(|&&l| l as usize >= NUM_CLASSES) {
            return Err(crate::TrainError::Data(format!(
                "label {} out of range [0, {})",
                label, NUM_CLASSES
            )));
        }
        Ok(Self { images, labels })
    }

    /// Get number of examples
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Get the CHW-planar pixel bytes of an image
    pub fn image(&self, idx: usize) -> ArrayView1<'_, u8> {
        self.images.row(idx)
    }

    /// Get the class label of an image
    pub fn label(&self, idx: usize) -> u8 {
        self.labels[idx]
    }

    /// Partition the corpus into deterministic train/validation index sets.
    ///
    /// `train_ratio` is the fraction that goes to the training stream. The
    /// shuffle is seeded with [`SPLIT_SEED`], so every run (fresh or resumed)
    /// produces the identical partition.
    pub fn split_indices(&self, train_ratio: f64) -> (Vec<usize>, Vec<usize>) {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        let mut rng = StdRng::seed_from_u64(SPLIT_SEED);
        indices.shuffle(&mut rng);

        let n_train = (self.len() as f64 * train_ratio) as usize;
        let val = indices.split_off(n_train);
        (indices, val)
    }
}

fn parse_records(
    bytes: &[u8],
    pixels: &mut Vec<u8>,
    labels: &mut Vec<u8>,
) -> std::result::Result<(), String> {
    if bytes.is_empty() || bytes.len() % RECORD_BYTES != 0 {
        return Err(format!(
            "file size {} is not a positive multiple of the {}-byte record",
            bytes.len(),
            RECORD_BYTES
        ));
    }

    for record in bytes.chunks_exact(RECORD_BYTES) {
        let label = record[0];
        if label as usize >= NUM_CLASSES {
            return Err(format!("label {} out of range [0, {})", label, NUM_CLASSES));
        }
        labels.push(label);
        pixels.extend_from_slice(&record[1..]);
    }

    Ok(())
}
