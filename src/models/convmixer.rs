/// ConvMixer model implementation
///
/// Patch-embedding stem followed by a stack of residual depthwise + pointwise
/// convolution blocks, a global average pool, and a linear classification
/// head.
use candle_core::{Module, Result, Tensor, D};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder};
use std::collections::HashMap;

use super::norm::BatchNorm2d;

/// ConvMixer hyperparameters
#[derive(Debug, Clone, Copy)]
pub struct ConvMixerConfig {
    /// Channel width after the patch embedding
    pub dim: usize,
    /// Number of mixer blocks
    pub depth: usize,
    /// Depthwise convolution kernel size (odd, for "same" padding)
    pub kernel_size: usize,
    /// Patch embedding size and stride
    pub patch_size: usize,
    /// Number of output classes
    pub n_classes: usize,
}

impl Default for ConvMixerConfig {
    fn default() -> Self {
        Self {
            dim: 256,
            depth: 8,
            kernel_size: 9,
            patch_size: 1,
            n_classes: 10,
        }
    }
}

impl ConvMixerConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.dim == 0 || self.depth == 0 || self.n_classes == 0 {
            return Err(crate::TrainError::Config(
                "dim, depth and n_classes must be > 0".to_string(),
            ));
        }
        if self.patch_size == 0 {
            return Err(crate::TrainError::Config(
                "patch_size must be > 0".to_string(),
            ));
        }
        if self.kernel_size % 2 == 0 {
            return Err(crate::TrainError::Config(format!(
                "kernel_size must be odd for same-padding, got {}",
                self.kernel_size
            )));
        }
        Ok(())
    }
}

/// One mixer block: residual depthwise convolution followed by a pointwise
/// channel mix, each with GELU + BatchNorm.
struct MixerBlock {
    depthwise: Conv2d,
    depthwise_norm: BatchNorm2d,
    pointwise: Conv2d,
    pointwise_norm: BatchNorm2d,
}

impl MixerBlock {
    fn new(dim: usize, kernel_size: usize, vb: VarBuilder) -> Result<Self> {
        let depthwise_cfg = Conv2dConfig {
            padding: kernel_size / 2,
            groups: dim,
            ..Default::default()
        };
        let depthwise = conv2d(dim, dim, kernel_size, depthwise_cfg, vb.pp("depthwise"))?;
        let depthwise_norm = BatchNorm2d::new(dim, vb.pp("depthwise_norm"))?;

        let pointwise = conv2d(dim, dim, 1, Conv2dConfig::default(), vb.pp("pointwise"))?;
        let pointwise_norm = BatchNorm2d::new(dim, vb.pp("pointwise_norm"))?;

        Ok(Self {
            depthwise,
            depthwise_norm,
            pointwise,
            pointwise_norm,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let spatial = self
            .depthwise_norm
            .forward_t(&self.depthwise.forward(xs)?.gelu_erf()?, train)?;
        let mixed = (spatial + xs)?;
        self.pointwise_norm
            .forward_t(&self.pointwise.forward(&mixed)?.gelu_erf()?, train)
    }
}

/// ConvMixer classifier
///
/// Stateful: batch-norm running statistics update only during training
/// forwards (`train == true`); evaluation forwards read them without
/// mutation.
pub struct ConvMixer {
    stem: Conv2d,
    stem_norm: BatchNorm2d,
    blocks: Vec<MixerBlock>,
    head: Linear,
}

impl ConvMixer {
    /// Create a new ConvMixer; all parameters register under `vb`'s VarMap.
    pub fn new(config: &ConvMixerConfig, vb: VarBuilder) -> crate::Result<Self> {
        config.validate()?;

        let stem_cfg = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let stem = conv2d(3, config.dim, config.patch_size, stem_cfg, vb.pp("stem"))?;
        let stem_norm = BatchNorm2d::new(config.dim, vb.pp("stem_norm"))?;

        let mut blocks = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            blocks.push(MixerBlock::new(
                config.dim,
                config.kernel_size,
                vb.pp(format!("blocks.{}", i)),
            )?);
        }

        let head = linear(config.dim, config.n_classes, vb.pp("head"))?;

        Ok(Self {
            stem,
            stem_norm,
            blocks,
            head,
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `xs` - Input images [batch, 3, height, width]
    /// * `train` - Training mode; controls batch-norm statistics
    ///
    /// # Returns
    /// Class logits [batch, n_classes]
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = self
            .stem_norm
            .forward_t(&self.stem.forward(xs)?.gelu_erf()?, train)?;

        for block in &self.blocks {
            xs = block.forward_t(&xs, train)?;
        }

        // global average pool over both spatial dims -> [batch, dim]
        let pooled = xs.mean(D::Minus1)?.mean(D::Minus1)?;
        self.head.forward(&pooled)
    }

    /// Batch-norm running statistics, named consistently with the VarMap
    /// parameter paths, for inclusion in a checkpoint snapshot.
    pub fn norm_state(&self) -> HashMap<String, Tensor> {
        let mut state = HashMap::new();
        for (key, tensor) in self.stem_norm.state() {
            state.insert(format!("stem_norm.{}", key), tensor);
        }
        for (i, block) in self.blocks.iter().enumerate() {
            for (key, tensor) in block.depthwise_norm.state() {
                state.insert(format!("blocks.{}.depthwise_norm.{}", i, key), tensor);
            }
            for (key, tensor) in block.pointwise_norm.state() {
                state.insert(format!("blocks.{}.pointwise_norm.{}", i, key), tensor);
            }
        }
        state
    }

    /// Restore batch-norm running statistics from a checkpoint snapshot
    pub fn load_norm_state(&self, state: &HashMap<String, Tensor>) -> crate::Result<()> {
        let restore = |prefix: &str, norm: &BatchNorm2d| -> crate::Result<()> {
            let mean = state.get(&format!("{}.running_mean", prefix)).ok_or_else(|| {
                crate::TrainError::Checkpoint(format!(
                    "checkpoint is missing '{}.running_mean'",
                    prefix
                ))
            })?;
            let var = state.get(&format!("{}.running_var", prefix)).ok_or_else(|| {
                crate::TrainError::Checkpoint(format!(
                    "checkpoint is missing '{}.running_var'",
                    prefix
                ))
            })?;
            norm.load_state(mean, var)?;
            Ok(())
        };

        restore("stem_norm", &self.stem_norm)?;
        for (i, block) in self.blocks.iter().enumerate() {
            restore(&format!("blocks.{}.depthwise_norm", i), &block.depthwise_norm)?;
            restore(&format!("blocks.{}.pointwise_norm", i), &block.pointwise_norm)?;
        }
        Ok(())
    }
}
