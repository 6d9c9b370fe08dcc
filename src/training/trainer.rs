/// Single-epoch training loop
use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::loss;
use rand::rngs::StdRng;
use std::sync::atomic::{AtomicBool, Ordering};

use super::cutmix::{self, CutMixConfig};
use super::optimizer::TrainOptimizer;
use super::scheduler::{Advance, LrSchedule};
use crate::data::BatchLoader;
use crate::models::ConvMixer;

/// Per-epoch loop configuration
#[derive(Debug, Clone)]
pub struct TrainLoopConfig {
    pub cutmix: CutMixConfig,
    /// Batches between progress log lines
    pub log_interval: usize,
}

/// Running loss/accuracy sums over a batch stream
///
/// Pure accumulation; logging reads from it but never feeds back.
#[derive(Debug, Clone, Default)]
pub struct EpochStats {
    loss_sum: f64,
    acc_sum: f64,
    batches: usize,
}

impl EpochStats {
    pub fn record(&mut self, loss: f64, accuracy: f64) {
        self.loss_sum += loss;
        self.acc_sum += accuracy;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn mean_loss(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.loss_sum / self.batches as f64
        }
    }

    pub fn mean_accuracy(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.acc_sum / self.batches as f64
        }
    }
}

/// Result of one epoch
#[derive(Debug, Clone)]
pub struct EpochReport {
    /// Mean loss over the epoch
    pub loss: f64,
    /// Mean accuracy over the epoch
    pub accuracy: f64,
    /// Learning rate of the last update
    pub final_lr: f64,
    /// True when the stop flag cut the epoch short
    pub interrupted: bool,
}

/// Fraction of predictions whose arg-max matches the target
pub fn accuracy(logits: &Tensor, targets: &Tensor) -> Result<f64> {
    let predicted = logits.argmax(D::Minus1)?;
    let correct = predicted
        .eq(targets)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(correct as f64 / targets.dim(0)? as f64)
}

/// Train the model for exactly one pass over the loader
///
/// Per batch: optional CutMix, forward in training mode, (blended)
/// cross-entropy, backward + optimizer update at the schedule's current rate,
/// then a step advancement event for the schedule. Accuracy is measured
/// against the original targets even when CutMix fired.
///
/// The stop flag is checked between batches; the in-flight batch always
/// completes, keeping optimizer and schedule state consistent. Backend
/// failures propagate without retry.
#[allow(clippy::too_many_arguments)]
pub fn train_one_epoch(
    epoch: usize,
    model: &ConvMixer,
    loader: &mut dyn BatchLoader,
    optimizer: &mut TrainOptimizer,
    schedule: &mut LrSchedule,
    config: &TrainLoopConfig,
    rng: &mut StdRng,
    stop: &AtomicBool,
    device: &Device,
) -> crate::Result<EpochReport> {
    let num_batches = loader.num_batches();
    loader.reset();

    let mut stats = EpochStats::default();
    let mut last_lr = schedule.current_lr();
    let mut batch_idx = 0usize;
    let mut interrupted = false;

    while let Some((inputs, targets)) = loader.next_batch(device)? {
        let mixed = cutmix::apply(&config.cutmix, &inputs, &targets, rng)?;

        let logits = model.forward_t(&mixed.inputs, true)?;
        let batch_loss = match &mixed.targets_b {
            Some(targets_b) => {
                let loss_a = (loss::cross_entropy(&logits, &mixed.targets_a)? * mixed.lam)?;
                let loss_b = (loss::cross_entropy(&logits, targets_b)? * (1.0 - mixed.lam))?;
                (loss_a + loss_b)?
            }
            None => loss::cross_entropy(&logits, &mixed.targets_a)?,
        };

        let loss_value = batch_loss.to_scalar::<f32>()? as f64;
        let batch_acc = accuracy(&logits, &targets)?;

        last_lr = schedule.current_lr();
        optimizer.set_learning_rate(last_lr);
        optimizer.backward_step(&batch_loss)?;
        schedule.advance(Advance::Step);

        stats.record(loss_value, batch_acc);
        batch_idx += 1;

        if batch_idx % config.log_interval == 0 {
            log::info!(
                "Epoch: {} [{}/{} ({:.0}%)]     Loss: {:.3} ({:.3})    Acc: {:.3} ({:.3})    lr: {:.6}",
                epoch + 1,
                batch_idx,
                num_batches,
                100.0 * batch_idx as f64 / num_batches as f64,
                loss_value,
                stats.mean_loss(),
                batch_acc,
                stats.mean_accuracy(),
                last_lr,
            );
        }

        if stop.load(Ordering::SeqCst) {
            interrupted = true;
            break;
        }
    }

    Ok(EpochReport {
        loss: stats.mean_loss(),
        accuracy: stats.mean_accuracy(),
        final_lr: last_lr,
        interrupted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::cifar::IMAGE_BYTES;
    use crate::data::{CifarDataset, CifarLoader, TransformPipeline};
    use crate::models::{ConvMixer, ConvMixerConfig};
    use crate::training::optimizer::Sgd;
    use crate::training::scheduler::{PlateauMode, ScheduleConfig, ScheduleKind};
    use candle_nn::{VarBuilder, VarMap};
    use ndarray::Array2;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn tiny_model(device: &Device) -> (ConvMixer, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let config = ConvMixerConfig {
            dim: 4,
            depth: 1,
            kernel_size: 3,
            patch_size: 4,
            n_classes: 10,
        };
        (ConvMixer::new(&config, vb).unwrap(), varmap)
    }

    fn tiny_loader(n: usize, batch_size: usize) -> CifarLoader {
        let pixels: Vec<u8> = (0..n * IMAGE_BYTES).map(|i| (i % 197) as u8).collect();
        let labels: Vec<u8> = (0..n).map(|i| (i % 10) as u8).collect();
        let images = Array2::from_shape_vec((n, IMAGE_BYTES), pixels).unwrap();
        let dataset = Arc::new(CifarDataset::from_raw(images, labels).unwrap());
        let indices = (0..n).collect();
        CifarLoader::new(dataset, indices, TransformPipeline::eval(), batch_size, false, 0)
    }

    fn frozen_optimizer(varmap: &VarMap) -> TrainOptimizer {
        let vars: Vec<(String, candle_core::Var)> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        TrainOptimizer::Sgd(Sgd::new(vars, 0.0, 0.0, 0.0))
    }

    fn constant_schedule(lr: f64) -> LrSchedule {
        let config = ScheduleConfig {
            kind: ScheduleKind::Constant,
            lr,
            min_lr: 0.0,
            epochs: 1,
            decay_rate: 0.1,
            t_initial: 1,
            t_mult: 1,
            plateau_mode: PlateauMode::Min,
            patience: 1,
        };
        LrSchedule::new(&config, 1).unwrap()
    }

    #[test]
    fn test_accuracy_extremes() -> Result<()> {
        let device = Device::Cpu;
        // logits argmax = [2, 0]
        let logits = Tensor::new(&[[0.1f32, 0.2, 0.9], [0.8, 0.1, 0.0]], &device)?;

        let perfect = Tensor::new(&[2u32, 0u32], &device)?;
        assert_eq!(accuracy(&logits, &perfect)?, 1.0);

        let none = Tensor::new(&[0u32, 1u32], &device)?;
        assert_eq!(accuracy(&logits, &none)?, 0.0);

        let half = Tensor::new(&[2u32, 1u32], &device)?;
        assert_eq!(accuracy(&logits, &half)?, 0.5);
        Ok(())
    }

    #[test]
    fn test_epoch_stats_means() {
        let mut stats = EpochStats::default();
        assert_eq!(stats.mean_loss(), 0.0);

        stats.record(1.0, 0.5);
        stats.record(3.0, 1.0);
        assert_eq!(stats.batches(), 2);
        assert!((stats.mean_loss() - 2.0).abs() < 1e-12);
        assert!((stats.mean_accuracy() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_epoch_means_match_per_batch_passes() -> crate::Result<()> {
        // frozen optimizer (lr = 0), so the model is static: the epoch means
        // must equal the means of two independent forward passes
        let device = Device::Cpu;
        let (model, varmap) = tiny_model(&device);
        let mut loader = tiny_loader(8, 4);
        let mut optimizer = frozen_optimizer(&varmap);
        let mut schedule = constant_schedule(0.0);
        let config = TrainLoopConfig {
            cutmix: CutMixConfig::default(),
            log_interval: 100,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let stop = AtomicBool::new(false);

        // expected means from manual per-batch evaluation
        let mut expected = EpochStats::default();
        loader.reset();
        while let Some((inputs, targets)) = loader.next_batch(&device)? {
            let logits = model.forward_t(&inputs, true)?;
            let batch_loss = loss::cross_entropy(&logits, &targets)?;
            expected.record(batch_loss.to_scalar::<f32>()? as f64, accuracy(&logits, &targets)?);
        }
        assert_eq!(expected.batches(), 2);

        let report = train_one_epoch(
            0,
            &model,
            &mut loader,
            &mut optimizer,
            &mut schedule,
            &config,
            &mut rng,
            &stop,
            &device,
        )?;

        assert!(!report.interrupted);
        assert_eq!(report.final_lr, 0.0);
        // batch-norm batch statistics make training forwards depend only on
        // the batch itself, so a frozen model repeats them exactly
        assert!((report.loss - expected.mean_loss()).abs() < 1e-5);
        assert!((report.accuracy - expected.mean_accuracy()).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_stop_flag_interrupts_after_batch() -> crate::Result<()> {
        let device = Device::Cpu;
        let (model, varmap) = tiny_model(&device);
        let mut loader = tiny_loader(8, 4);
        let mut optimizer = frozen_optimizer(&varmap);
        let mut schedule = constant_schedule(0.0);
        let config = TrainLoopConfig {
            cutmix: CutMixConfig::default(),
            log_interval: 100,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let stop = AtomicBool::new(true); // raised before the loop starts

        let report = train_one_epoch(
            0,
            &model,
            &mut loader,
            &mut optimizer,
            &mut schedule,
            &config,
            &mut rng,
            &stop,
            &device,
        )?;

        // the in-flight batch completes, then the loop stops
        assert!(report.interrupted);
        assert!(report.loss > 0.0);
        Ok(())
    }

    #[test]
    fn test_cutmix_epoch_still_trains() -> crate::Result<()> {
        let device = Device::Cpu;
        let (model, varmap) = tiny_model(&device);
        let mut loader = tiny_loader(8, 4);
        let vars: Vec<(String, candle_core::Var)> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        let mut optimizer = TrainOptimizer::Sgd(Sgd::new(vars, 0.01, 0.9, 0.0));
        let mut schedule = constant_schedule(0.01);
        let config = TrainLoopConfig {
            cutmix: CutMixConfig { beta: 1.0, prob: 1.0 },
            log_interval: 1,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let stop = AtomicBool::new(false);

        let report = train_one_epoch(
            0,
            &model,
            &mut loader,
            &mut optimizer,
            &mut schedule,
            &config,
            &mut rng,
            &stop,
            &device,
        )?;

        assert!(!report.interrupted);
        assert!(report.loss.is_finite());
        assert!((0.0..=1.0).contains(&report.accuracy));
        assert_eq!(report.final_lr, 0.01);
        Ok(())
    }
}
