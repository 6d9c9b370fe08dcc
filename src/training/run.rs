/// Run orchestration: wires model, optimizer, schedule and loaders together
/// across epochs, with checkpointing, resumption and metric export.
use candle_core::{DType, Device, Var};
use candle_nn::{VarBuilder, VarMap};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::checkpoint::{self, Checkpoint, CheckpointMetadata};
use super::metrics::{EpochRecord, MetricsLog};
use super::optimizer::create_optimizer;
use super::optimizer::TrainOptimizer;
use super::scheduler::{Advance, LrSchedule};
use super::trainer::{train_one_epoch, TrainLoopConfig};
use super::validator::validate;
use crate::config::ResolvedConfig;
use crate::data::{BatchLoader, CifarDataset, CifarLoader, TransformPipeline};
use crate::models::{create_model, ConvMixer, ModelKind};

/// Run-level settings
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Fraction of the corpus that trains; the rest validates
    pub val_ratio: f64,
    pub data_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Experiment identifier; names the checkpoint and log sub-folders
    pub experiment: String,
    /// Checkpoints to keep per experiment
    pub checkpoint_hist: usize,
    /// Accepted for config compatibility; the loop does not act on it
    pub recovery_interval: usize,
    pub resume: Option<PathBuf>,
    /// Seed for shuffling and augmentation draws
    pub seed: u64,
}

/// Outcome of a completed (or interrupted) run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub epochs_run: usize,
    pub best_acc: Option<f64>,
    pub interrupted: bool,
    pub metrics_path: Option<PathBuf>,
}

/// Strict-improvement watermark check: the first observation always passes.
fn improves(best: Option<f64>, acc: f64) -> bool {
    best.map_or(true, |b| acc > b)
}

/// A fully constructed training run
pub struct TrainingRun {
    device: Device,
    model_kind: ModelKind,
    model: ConvMixer,
    varmap: VarMap,
    optimizer: TrainOptimizer,
    schedule: LrSchedule,
    train_loader: CifarLoader,
    val_loader: CifarLoader,
    loop_config: TrainLoopConfig,
    run_config: RunConfig,
    rng: StdRng,
    start_epoch: usize,
    best_acc: Option<f64>,
    metrics: MetricsLog,
}

impl TrainingRun {
    /// Construct everything a run needs; resumes from a checkpoint when the
    /// config names one. Configuration problems and unreadable resume files
    /// fail here, before any epoch starts.
    pub fn new(config: &ResolvedConfig, device: Device) -> crate::Result<Self> {
        let run_config = config.run.clone();

        let dataset = Arc::new(CifarDataset::from_directory(&run_config.data_dir)?);
        let (train_indices, val_indices) = dataset.split_indices(run_config.val_ratio);
        log::info!(
            "Split: {} training / {} validation samples",
            train_indices.len(),
            val_indices.len()
        );

        let train_loader = CifarLoader::new(
            dataset.clone(),
            train_indices,
            TransformPipeline::train(&config.augment),
            run_config.batch_size,
            true,
            run_config.seed,
        );
        let val_loader = CifarLoader::new(
            dataset,
            val_indices,
            TransformPipeline::eval(),
            run_config.batch_size,
            false,
            run_config.seed.wrapping_add(1),
        );
        if train_loader.is_empty() || val_loader.is_empty() {
            return Err(crate::TrainError::Config(
                "train/validation split left one side empty; adjust val_ratio".to_string(),
            ));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = create_model(config.model, vb)?;

        let num_params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        log::info!("{} created, # of params: {}", config.model.as_str(), num_params);

        let named_vars = named_vars(&varmap);
        let mut optimizer = create_optimizer(named_vars, &config.optimizer)?;
        let mut schedule = LrSchedule::new(&config.schedule, train_loader.num_batches())?;

        let mut start_epoch = 0;
        let mut best_acc = None;
        if let Some(resume_path) = &run_config.resume {
            let ckpt = Checkpoint::load(resume_path, &device)?;
            restore_model_state(&varmap, &ckpt.model_state)?;
            model.load_norm_state(&ckpt.model_state)?;
            optimizer.load_state(&ckpt.optimizer_state)?;
            start_epoch = ckpt.metadata.epoch + 1;
            best_acc = Some(ckpt.metadata.acc);
            schedule.fast_forward(start_epoch);
            schedule.restore_lr(ckpt.metadata.lr);
            log::info!(
                "Resumed from {:?}: continuing at epoch {}, best acc {:.4}",
                resume_path,
                start_epoch + 1,
                ckpt.metadata.acc
            );
        }

        Ok(Self {
            device,
            model_kind: config.model,
            model,
            varmap,
            optimizer,
            schedule,
            train_loader,
            val_loader,
            loop_config: config.train_loop.clone(),
            run_config,
            rng: StdRng::seed_from_u64(config.run.seed),
            start_epoch,
            best_acc,
            metrics: MetricsLog::new(),
        })
    }

    /// Drive the epoch loop until all epochs finish or `stop` is raised
    ///
    /// An interrupt is a clean exit: accumulated metrics still export, and
    /// the process result is success.
    pub fn run(&mut self, stop: &AtomicBool) -> crate::Result<RunSummary> {
        let total_epochs = self.run_config.epochs;
        let mut interrupted = false;
        let mut epochs_run = 0usize;

        log::info!(
            "Training {} for epochs {}..{}",
            self.model_kind.as_str(),
            self.start_epoch + 1,
            total_epochs
        );

        for epoch in self.start_epoch..total_epochs {
            if stop.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }

            let epoch_start = Instant::now();

            let report = train_one_epoch(
                epoch,
                &self.model,
                &mut self.train_loader,
                &mut self.optimizer,
                &mut self.schedule,
                &self.loop_config,
                &mut self.rng,
                stop,
                &self.device,
            )?;

            if report.interrupted {
                log::info!("Interrupt observed during epoch {}; stopping", epoch + 1);
                interrupted = true;
                break;
            }

            let (val_loss, val_acc) = validate(&self.model, &mut self.val_loader, &self.device)?;
            self.schedule.advance(Advance::Epoch { val_loss });

            let t_epoch = epoch_start.elapsed().as_secs_f64();
            log::info!(
                "Epoch {} complete:\n\tTrain Acc: {:.2}\n\tVal Acc: {:.2}\n\tlr: {:.5}\n\tTime: {:.1}s",
                epoch + 1,
                report.accuracy,
                val_acc,
                report.final_lr,
                t_epoch
            );

            self.metrics.record(
                epoch,
                EpochRecord {
                    train_loss: report.loss,
                    train_acc: report.accuracy,
                    val_loss,
                    val_acc,
                    lr: report.final_lr,
                    t_epoch,
                },
            );
            epochs_run += 1;

            if improves(self.best_acc, val_acc) {
                if let Some(previous) = self.best_acc {
                    log::info!(
                        "Accuracy increased ({:.2} -> {:.2}). Saving model...",
                        previous,
                        val_acc
                    );
                }
                self.save_checkpoint(epoch, val_loss, val_acc, report.final_lr)?;
                self.best_acc = Some(val_acc);
            }
        }

        let metrics_path = self.export_metrics()?;

        Ok(RunSummary {
            epochs_run,
            best_acc: self.best_acc,
            interrupted,
            metrics_path,
        })
    }

    fn save_checkpoint(
        &self,
        epoch: usize,
        loss: f64,
        acc: f64,
        lr: f64,
    ) -> crate::Result<()> {
        let dir = self.run_config.checkpoint_dir.join(&self.run_config.experiment);

        let mut model_state = HashMap::new();
        for (name, var) in self.varmap.data().lock().unwrap().iter() {
            model_state.insert(name.clone(), var.as_tensor().clone());
        }
        // batch-norm running statistics live in the layers, not the VarMap
        model_state.extend(self.model.norm_state());

        let checkpoint = Checkpoint::new(
            CheckpointMetadata {
                model: self.model_kind.as_str().to_string(),
                epoch,
                loss,
                acc,
                lr,
            },
            model_state,
            self.optimizer.state()?,
        );
        let path = checkpoint.save(&dir)?;
        log::info!("Checkpoint saved to {:?}", path);

        checkpoint::prune_history(&dir, self.run_config.checkpoint_hist)?;
        Ok(())
    }

    fn export_metrics(&self) -> crate::Result<Option<PathBuf>> {
        if self.metrics.is_empty() {
            return Ok(None);
        }
        let dir = self.run_config.log_dir.join(&self.run_config.experiment);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("train_{}.json", Utc::now().timestamp()));
        self.metrics.export(&path)?;
        log::info!("Metrics exported to {:?}", path);
        Ok(Some(path))
    }
}

/// Snapshot the VarMap as name-sorted (name, var) pairs, so optimizer state
/// iteration order is deterministic.
fn named_vars(varmap: &VarMap) -> Vec<(String, Var)> {
    let mut vars: Vec<(String, Var)> = varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

/// Overwrite every model variable from a checkpoint's parameter map
fn restore_model_state(
    varmap: &VarMap,
    state: &HashMap<String, candle_core::Tensor>,
) -> crate::Result<()> {
    for (name, var) in varmap.data().lock().unwrap().iter() {
        let tensor = state.get(name).ok_or_else(|| {
            crate::TrainError::Checkpoint(format!("checkpoint is missing parameter '{}'", name))
        })?;
        var.set(tensor)?;
    }
    Ok(())
}
