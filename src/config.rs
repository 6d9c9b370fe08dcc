/// Run configuration
///
/// `TrainSpec` is the flat key-value surface shared by the YAML config file
/// and the command line, with the script's historical defaults. `resolve()`
/// validates it once at startup and produces the narrow per-component
/// configuration structs the rest of the crate consumes; unknown model,
/// optimizer or scheduler names are rejected here, before any data or device
/// work.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::data::AugmentConfig;
use crate::models::ModelKind;
use crate::training::cutmix::CutMixConfig;
use crate::training::optimizer::OptimizerConfig;
use crate::training::run::RunConfig;
use crate::training::scheduler::ScheduleConfig;
use crate::training::trainer::TrainLoopConfig;

/// The full tunable surface, config-file defaults included
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainSpec {
    // model
    pub model: String,
    pub resume: Option<String>,
    pub batch_size: usize,

    // optimizer
    pub opt: String,
    pub opt_eps: Option<f64>,
    pub momentum: f64,
    pub weight_decay: f64,

    // learning-rate schedule
    pub sched: String,
    pub lr: f64,
    pub min_lr: f64,
    pub epochs: usize,
    pub decay_rate: f64,
    pub t_initial: usize,
    pub t_mult: usize,
    pub plateau_mode: String,
    pub patience: usize,

    // augmentation & regularization
    pub val_ratio: f64,
    pub hflip: f64,
    pub vflip: f64,
    pub scale: f64,
    pub rand_aug: bool,
    pub ra_n: usize,
    pub ra_m: f64,
    pub erase: f64,
    pub jitter: f64,
    pub beta: f64,
    pub cutmix_prob: f64,

    // misc
    pub data_dir: String,
    pub log_interval: usize,
    pub recovery_interval: usize,
    pub checkpoint_hist: usize,
    pub checkpoint_dir: String,
    pub log_dir: String,
    pub experiment: String,
    pub seed: u64,
}

impl Default for TrainSpec {
    fn default() -> Self {
        Self {
            model: "convmixer256_8_k9_p1".to_string(),
            resume: None,
            batch_size: 512,

            opt: "sgd".to_string(),
            opt_eps: None,
            momentum: 0.9,
            weight_decay: 5e-5,

            sched: "onecycle".to_string(),
            lr: 0.01,
            min_lr: 0.0,
            epochs: 300,
            decay_rate: 0.1,
            t_initial: 200,
            t_mult: 1,
            plateau_mode: "min".to_string(),
            patience: 10,

            val_ratio: 0.9,
            hflip: 0.5,
            vflip: 0.0,
            scale: 1.0,
            rand_aug: false,
            ra_n: 0,
            ra_m: 0.0,
            erase: 0.25,
            jitter: 0.1,
            beta: 0.0,
            cutmix_prob: 0.0,

            data_dir: ".data/cifar-10-batches-bin".to_string(),
            log_interval: 50,
            recovery_interval: 0,
            checkpoint_hist: 10,
            checkpoint_dir: "checkpoints".to_string(),
            log_dir: "logs".to_string(),
            experiment: String::new(),
            seed: 42,
        }
    }
}

/// Narrow per-component configurations, validated and ready to use
pub struct ResolvedConfig {
    pub model: ModelKind,
    pub optimizer: OptimizerConfig,
    pub schedule: ScheduleConfig,
    pub augment: AugmentConfig,
    pub train_loop: TrainLoopConfig,
    pub run: RunConfig,
}

impl TrainSpec {
    /// Read a YAML config file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::TrainError::Config(format!(
                "cannot read config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Serialize for the run-config copy written into the log directory
    pub fn to_yaml(&self) -> crate::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate and split into per-component configurations
    pub fn resolve(&self) -> crate::Result<ResolvedConfig> {
        let model: ModelKind = self.model.parse()?;

        if self.batch_size == 0 {
            return Err(config_err("batch_size must be > 0"));
        }
        if self.epochs == 0 {
            return Err(config_err("epochs must be > 0"));
        }
        if self.log_interval == 0 {
            return Err(config_err("log_interval must be > 0"));
        }
        if !(self.lr > 0.0) {
            return Err(config_err("lr must be > 0"));
        }
        if self.min_lr < 0.0 {
            return Err(config_err("min_lr must be >= 0"));
        }
        if !(self.val_ratio > 0.0 && self.val_ratio < 1.0) {
            return Err(config_err("val_ratio must be in (0, 1)"));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(config_err("momentum must be in [0, 1)"));
        }
        if self.weight_decay < 0.0 {
            return Err(config_err("weight_decay must be >= 0"));
        }
        if !(self.scale > 0.0 && self.scale <= 1.0) {
            return Err(config_err("scale must be in (0, 1]"));
        }
        for (name, p) in [
            ("hflip", self.hflip),
            ("vflip", self.vflip),
            ("erase", self.erase),
            ("cutmix_prob", self.cutmix_prob),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(config_err(&format!("{} must be in [0, 1]", name)));
            }
        }
        if self.jitter < 0.0 {
            return Err(config_err("jitter must be >= 0"));
        }
        if self.beta < 0.0 {
            return Err(config_err("beta must be >= 0"));
        }

        let optimizer = OptimizerConfig {
            kind: self.opt.parse()?,
            lr: self.lr,
            eps: self.opt_eps,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
        };

        let schedule = ScheduleConfig {
            kind: self.sched.parse()?,
            lr: self.lr,
            min_lr: self.min_lr,
            epochs: self.epochs,
            decay_rate: self.decay_rate,
            t_initial: self.t_initial,
            t_mult: self.t_mult,
            plateau_mode: self.plateau_mode.parse()?,
            patience: self.patience,
        };

        let augment = AugmentConfig {
            hflip: self.hflip,
            vflip: self.vflip,
            scale: self.scale,
            rand_aug: self.rand_aug,
            ra_n: self.ra_n,
            ra_m: self.ra_m,
            jitter: self.jitter,
            erase: self.erase,
        };

        let train_loop = TrainLoopConfig {
            cutmix: CutMixConfig {
                beta: self.beta,
                prob: self.cutmix_prob,
            },
            log_interval: self.log_interval,
        };

        let run = RunConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            val_ratio: self.val_ratio,
            data_dir: PathBuf::from(&self.data_dir),
            checkpoint_dir: PathBuf::from(&self.checkpoint_dir),
            log_dir: PathBuf::from(&self.log_dir),
            experiment: self.experiment.clone(),
            checkpoint_hist: self.checkpoint_hist,
            recovery_interval: self.recovery_interval,
            resume: self.resume.as_ref().map(PathBuf::from),
            seed: self.seed,
        };

        Ok(ResolvedConfig {
            model,
            optimizer,
            schedule,
            augment,
            train_loop,
            run,
        })
    }
}

fn config_err(msg: &str) -> crate::TrainError {
    crate::TrainError::Config(msg.to_string())
}
