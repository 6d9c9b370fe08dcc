/// Model factory: the supported architectures as a closed enumeration
pub mod convmixer;
pub mod norm;

pub use convmixer::{ConvMixer, ConvMixerConfig};
pub use norm::BatchNorm2d;

use candle_nn::VarBuilder;
use std::str::FromStr;

/// The supported model architectures
///
/// Unknown names are rejected at configuration time, before any data or
/// device work happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// ConvMixer-256/8, 5x5 kernels, 1x1 patches
    Depth8K5P1,
    /// ConvMixer-256/8, 5x5 kernels, 2x2 patches
    Depth8K5P2,
    /// ConvMixer-256/8, 9x9 kernels, 1x1 patches
    Depth8K9P1,
    /// ConvMixer-256/8, 9x9 kernels, 2x2 patches
    Depth8K9P2,
    /// ConvMixer-256/16, 9x9 kernels, 2x2 patches
    Depth16K9P2,
}

impl ModelKind {
    /// All registered names, for error messages
    pub const NAMES: [&'static str; 5] = [
        "convmixer256_8_k5_p1",
        "convmixer256_8_k5_p2",
        "convmixer256_8_k9_p1",
        "convmixer256_8_k9_p2",
        "convmixer256_16_k9_p2",
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Depth8K5P1 => "convmixer256_8_k5_p1",
            Self::Depth8K5P2 => "convmixer256_8_k5_p2",
            Self::Depth8K9P1 => "convmixer256_8_k9_p1",
            Self::Depth8K9P2 => "convmixer256_8_k9_p2",
            Self::Depth16K9P2 => "convmixer256_16_k9_p2",
        }
    }

    /// The architecture hyperparameters for this kind
    pub fn config(&self) -> ConvMixerConfig {
        let (depth, kernel_size, patch_size) = match self {
            Self::Depth8K5P1 => (8, 5, 1),
            Self::Depth8K5P2 => (8, 5, 2),
            Self::Depth8K9P1 => (8, 9, 1),
            Self::Depth8K9P2 => (8, 9, 2),
            Self::Depth16K9P2 => (16, 9, 2),
        };
        ConvMixerConfig {
            dim: 256,
            depth,
            kernel_size,
            patch_size,
            n_classes: crate::data::NUM_CLASSES,
        }
    }
}

impl FromStr for ModelKind {
    type Err = crate::TrainError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "convmixer256_8_k5_p1" => Ok(Self::Depth8K5P1),
            "convmixer256_8_k5_p2" => Ok(Self::Depth8K5P2),
            "convmixer256_8_k9_p1" => Ok(Self::Depth8K9P1),
            "convmixer256_8_k9_p2" => Ok(Self::Depth8K9P2),
            "convmixer256_16_k9_p2" => Ok(Self::Depth16K9P2),
            _ => Err(crate::TrainError::Config(format!(
                "unknown model '{}', expected one of: {}",
                s,
                Self::NAMES.join(", ")
            ))),
        }
    }
}

/// Construct the model for `kind`, registering parameters under `vb`
pub fn create_model(kind: ModelKind, vb: VarBuilder) -> crate::Result<ConvMixer> {
    ConvMixer::new(&kind.config(), vb)
}
