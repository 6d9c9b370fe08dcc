//! CIFAR-10 training harness
//!
//! A Rust port of a pared-down timm-style training script for CIFAR-10
//! classification models, built on candle.
//!
//! # Components
//!
//! - **Model factory**: the ConvMixer family behind a closed [`models::ModelKind`]
//! - **Optimizer/scheduler factory**: SGD/AdamW and a closed set of
//!   learning-rate schedules with per-step or per-epoch cadence
//! - **Augmentation pipeline**: stochastic transforms for training, a fixed
//!   normalize-only pass for evaluation
//! - **Epoch trainer / validator**: one pass over the batch stream with
//!   optional CutMix regularization, and a no-grad evaluation pass
//! - **Run orchestrator**: the epoch loop with checkpointing, best-model
//!   tracking, resumption and metric export
//!
//! # Example
//!
//! ```ignore
//! use cifar_train::config::TrainSpec;
//! use cifar_train::training::run::TrainingRun;
//!
//! let resolved = TrainSpec::default().resolve()?;
//! let mut run = TrainingRun::new(&resolved, device)?;
//! let summary = run.run(&stop_flag)?;
//! ```

pub mod config;
pub mod data;
pub mod models;
pub mod training;

// Re-export commonly used items
pub use config::{ResolvedConfig, TrainSpec};
pub use models::ModelKind;

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, TrainError>;
