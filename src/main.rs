//! CIFAR-10 training CLI
//!
//! Loads defaults, overlays a YAML config file when one is given, then
//! overlays any explicit command-line flags, and drives a full training run.
//! Ctrl-C requests a clean stop: the in-flight batch finishes and accumulated
//! metrics still export.
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use candle_core::Device;
use clap::Parser;

use cifar_train::training::run::TrainingRun;
use cifar_train::TrainSpec;

/// CIFAR-10 Training
#[derive(Parser, Debug)]
#[command(name = "train")]
#[command(about = "Train CIFAR-10 classification models", long_about = None)]
struct Cli {
    /// YAML config file specifying default arguments
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    // Model parameters
    /// Name of model to train
    #[arg(long, value_name = "MODEL")]
    model: Option<String>,
    /// Resume full model and optimizer state from checkpoint
    #[arg(long, value_name = "PATH")]
    resume: Option<PathBuf>,
    /// Input batch size for training
    #[arg(short = 'b', long, value_name = "N")]
    batch_size: Option<usize>,

    // Optimizer parameters
    /// Optimizer
    #[arg(long, value_name = "OPTIMIZER")]
    opt: Option<String>,
    /// Optimizer epsilon
    #[arg(long, value_name = "EPSILON")]
    opt_eps: Option<f64>,
    /// Optimizer momentum
    #[arg(long, value_name = "M")]
    momentum: Option<f64>,
    /// Weight decay
    #[arg(long, value_name = "WD")]
    weight_decay: Option<f64>,

    // Learning rate schedule parameters
    /// LR scheduler
    #[arg(long, value_name = "SCHEDULER")]
    sched: Option<String>,
    /// Learning rate
    #[arg(long, value_name = "LR")]
    lr: Option<f64>,
    /// Minimum learning rate (only used by some schedulers)
    #[arg(long, value_name = "MINLR")]
    min_lr: Option<f64>,
    /// Number of epochs to train
    #[arg(long, value_name = "N")]
    epochs: Option<usize>,
    /// LR decay rate
    #[arg(long, value_name = "RATE")]
    decay_rate: Option<f64>,
    /// T_0 for cosine annealing
    #[arg(long, value_name = "T_0")]
    t_initial: Option<usize>,
    /// T_mult for cosine annealing
    #[arg(long, value_name = "T_M")]
    t_mult: Option<usize>,
    /// Plateau mode for LR reduction on plateau
    #[arg(long, value_name = "MODE")]
    plateau_mode: Option<String>,
    /// Epochs to wait before reducing LR
    #[arg(long, value_name = "PAT")]
    patience: Option<usize>,

    // Augmentation & regularization parameters
    /// Ratio for train-validation split
    #[arg(long, value_name = "SPLIT")]
    val_ratio: Option<f64>,
    /// Horizontal flip probability
    #[arg(long, value_name = "HF")]
    hflip: Option<f64>,
    /// Vertical flip probability
    #[arg(long, value_name = "VF")]
    vflip: Option<f64>,
    /// Scale value for random resizing
    #[arg(long, value_name = "SCALE")]
    scale: Option<f64>,
    /// Toggle random augmentation
    #[arg(long)]
    rand_aug: bool,
    /// Number of operations for random augmentation
    #[arg(long, value_name = "N")]
    ra_n: Option<usize>,
    /// Magnitude of random augmentation operations
    #[arg(long, value_name = "M")]
    ra_m: Option<f64>,
    /// Random erase probability
    #[arg(long, value_name = "RE")]
    erase: Option<f64>,
    /// Color jitter strength
    #[arg(long, value_name = "JITTER")]
    jitter: Option<f64>,
    /// CutMix beta
    #[arg(long, value_name = "BETA")]
    beta: Option<f64>,
    /// CutMix probability
    #[arg(long, value_name = "PROB")]
    cutmix_prob: Option<f64>,

    // Misc
    /// Path to the CIFAR-10 binary batch files
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,
    /// Batches to wait before logging training status
    #[arg(long, value_name = "N")]
    log_interval: Option<usize>,
    /// Batches to wait before writing recovery checkpoint
    #[arg(long, value_name = "N")]
    recovery_interval: Option<usize>,
    /// Checkpoints to keep
    #[arg(long, value_name = "N")]
    checkpoint_hist: Option<usize>,
    /// Path to checkpoints
    #[arg(long, value_name = "DIR")]
    checkpoint_dir: Option<PathBuf>,
    /// Path to training logs
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
    /// Experiment identifier, names log and checkpoint sub-folders
    #[arg(long, value_name = "NAME")]
    experiment: Option<String>,
    /// Seed for shuffling and augmentation
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,
}

impl Cli {
    /// Explicit flags override whatever the config file set
    fn overlay(&self, spec: &mut TrainSpec) {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = &self.$field {
                    spec.$field = value.clone();
                })*
            };
        }
        overlay!(
            model, opt, sched, plateau_mode, experiment,
        );
        macro_rules! overlay_copy {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = self.$field {
                    spec.$field = value;
                })*
            };
        }
        overlay_copy!(
            batch_size, momentum, weight_decay, lr, min_lr, epochs, decay_rate,
            t_initial, t_mult, patience, val_ratio, hflip, vflip, scale, ra_n,
            ra_m, erase, jitter, beta, cutmix_prob, log_interval,
            recovery_interval, checkpoint_hist, seed,
        );
        if let Some(eps) = self.opt_eps {
            spec.opt_eps = Some(eps);
        }
        if self.rand_aug {
            spec.rand_aug = true;
        }
        if let Some(path) = &self.resume {
            spec.resume = Some(path.to_string_lossy().into_owned());
        }
        if let Some(dir) = &self.data_dir {
            spec.data_dir = dir.to_string_lossy().into_owned();
        }
        if let Some(dir) = &self.checkpoint_dir {
            spec.checkpoint_dir = dir.to_string_lossy().into_owned();
        }
        if let Some(dir) = &self.log_dir {
            spec.log_dir = dir.to_string_lossy().into_owned();
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut spec = match &cli.config {
        Some(path) => TrainSpec::from_yaml_file(path)?,
        None => TrainSpec::default(),
    };
    cli.overlay(&mut spec);

    log::info!("Preparing experiment {}...", spec.experiment);
    let resolved = spec.resolve()?;

    // keep a copy of the resolved configuration next to the run's logs
    let log_path = resolved.run.log_dir.join(&resolved.run.experiment);
    std::fs::create_dir_all(&log_path)
        .with_context(|| format!("cannot create log directory {:?}", log_path))?;
    std::fs::write(
        log_path.join(format!("{}_config.yml", resolved.run.experiment)),
        spec.to_yaml()?,
    )?;

    // Device setup - try CUDA first, fall back to CPU
    let device = if candle_core::utils::cuda_is_available() {
        Device::new_cuda(0)?
    } else {
        Device::Cpu
    };
    log::info!("Using device: {:?}", device);

    // Ctrl-C raises the cooperative stop flag; the loop exits cleanly
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            log::warn!("Interrupt received; finishing current batch and shutting down");
            stop.store(true, Ordering::SeqCst);
        })
        .context("cannot install interrupt handler")?;
    }

    let mut run = TrainingRun::new(&resolved, device)?;
    let summary = run.run(&stop)?;

    if summary.interrupted {
        log::info!(
            "Run interrupted after {} epoch(s); best val acc: {:?}",
            summary.epochs_run,
            summary.best_acc
        );
    } else {
        log::info!(
            "Run complete: {} epoch(s), best val acc: {:?}",
            summary.epochs_run,
            summary.best_acc
        );
    }

    Ok(())
}
