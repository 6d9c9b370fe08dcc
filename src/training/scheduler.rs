/// Learning-rate schedules
///
/// Each schedule kind declares its own cadence: per-update schedules react to
/// `Advance::Step`, epoch/metric-granular ones to `Advance::Epoch`. The
/// trainer and orchestrator fire both events unconditionally and never branch
/// on the concrete kind.
use std::f64::consts::PI;
use std::str::FromStr;

/// The supported schedule kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    OneCycle,
    CosineRestarts,
    Plateau,
    Constant,
}

impl FromStr for ScheduleKind {
    type Err = crate::TrainError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "onecycle" => Ok(Self::OneCycle),
            "cosine_warm" => Ok(Self::CosineRestarts),
            "plateau" => Ok(Self::Plateau),
            "constant" => Ok(Self::Constant),
            _ => Err(crate::TrainError::Config(format!(
                "unknown scheduler '{}', expected one of: onecycle, cosine_warm, plateau, constant",
                s
            ))),
        }
    }
}

/// Direction a plateau-watched metric should move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateauMode {
    /// Metric should decrease (e.g. loss)
    Min,
    /// Metric should increase (e.g. accuracy)
    Max,
}

impl FromStr for PlateauMode {
    type Err = crate::TrainError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            _ => Err(crate::TrainError::Config(format!(
                "unknown plateau mode '{}', expected 'min' or 'max'",
                s
            ))),
        }
    }
}

/// Schedule hyperparameters, independent of the batch-stream geometry
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub kind: ScheduleKind,
    /// Peak / base learning rate
    pub lr: f64,
    /// Floor learning rate, used by some kinds
    pub min_lr: f64,
    /// Total epochs in the run
    pub epochs: usize,
    /// Plateau reduction factor
    pub decay_rate: f64,
    /// First cosine-restart cycle length, in epochs
    pub t_initial: usize,
    /// Cycle-length multiplier after each restart
    pub t_mult: usize,
    pub plateau_mode: PlateauMode,
    /// Epochs without improvement before a plateau reduction
    pub patience: usize,
}

/// Which event moves a schedule forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    PerStep,
    PerEpoch,
}

/// Advancement event fired by the training loop
#[derive(Debug, Clone, Copy)]
pub enum Advance {
    /// One optimizer update happened
    Step,
    /// One epoch finished, with its validation loss
    Epoch { val_loss: f64 },
}

/// One-cycle policy: linear warmup to the peak, cosine anneal to the floor
#[derive(Debug, Clone)]
pub struct OneCycle {
    max_lr: f64,
    total_steps: usize,
    steps_per_epoch: usize,
    step: usize,
}

/// Warmup fraction of the cycle
const ONECYCLE_PCT_START: f64 = 0.3;
/// Peak over initial learning rate
const ONECYCLE_DIV: f64 = 25.0;
/// Peak over final learning rate
const ONECYCLE_FINAL_DIV: f64 = 1e4;

impl OneCycle {
    fn lr_at(&self, step: usize) -> f64 {
        let initial_lr = self.max_lr / ONECYCLE_DIV;
        let final_lr = self.max_lr / ONECYCLE_FINAL_DIV;
        let warmup_steps = (self.total_steps as f64 * ONECYCLE_PCT_START).round() as usize;

        if step < warmup_steps {
            let progress = step as f64 / warmup_steps as f64;
            initial_lr + (self.max_lr - initial_lr) * progress
        } else {
            let remaining = (self.total_steps - warmup_steps).max(1);
            let progress = ((step - warmup_steps) as f64 / remaining as f64).min(1.0);
            let cosine = 0.5 * (1.0 + (PI * progress).cos());
            final_lr + (self.max_lr - final_lr) * cosine
        }
    }
}

/// Cosine annealing with warm restarts, advanced in fractional epochs
#[derive(Debug, Clone)]
pub struct CosineRestarts {
    base_lr: f64,
    min_lr: f64,
    t_mult: usize,
    /// Position within the current cycle, in epochs
    t_cur: f64,
    /// Current cycle length, in epochs
    t_i: f64,
    /// Fractional-epoch increment per optimizer step
    step_size: f64,
}

impl CosineRestarts {
    fn consume_restarts(&mut self) {
        while self.t_cur >= self.t_i {
            self.t_cur -= self.t_i;
            if self.t_mult > 1 {
                self.t_i *= self.t_mult as f64;
            }
        }
    }
}

/// Reduce-on-plateau over an epoch metric
#[derive(Debug, Clone)]
pub struct Plateau {
    current_lr: f64,
    factor: f64,
    patience: usize,
    min_lr: f64,
    mode: PlateauMode,
    best: f64,
    bad_epochs: usize,
}

impl Plateau {
    fn observe(&mut self, metric: f64) {
        let improved = match self.mode {
            PlateauMode::Min => metric < self.best,
            PlateauMode::Max => metric > self.best,
        };

        if improved {
            self.best = metric;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
            if self.bad_epochs >= self.patience {
                let reduced = (self.current_lr * self.factor).max(self.min_lr);
                if reduced < self.current_lr {
                    self.current_lr = reduced;
                }
                self.bad_epochs = 0;
            }
        }
    }
}

/// A configured learning-rate schedule
pub enum LrSchedule {
    OneCycle(OneCycle),
    CosineRestarts(CosineRestarts),
    Plateau(Plateau),
    Constant { lr: f64 },
}

impl LrSchedule {
    /// Build the schedule named by `config` for a stream of
    /// `steps_per_epoch` updates per epoch.
    pub fn new(config: &ScheduleConfig, steps_per_epoch: usize) -> crate::Result<Self> {
        if steps_per_epoch == 0 {
            return Err(crate::TrainError::Config(
                "steps_per_epoch must be > 0".to_string(),
            ));
        }
        let schedule = match config.kind {
            ScheduleKind::OneCycle => Self::OneCycle(OneCycle {
                max_lr: config.lr,
                total_steps: (config.epochs * steps_per_epoch).max(1),
                steps_per_epoch,
                step: 0,
            }),
            ScheduleKind::CosineRestarts => {
                if config.t_initial == 0 {
                    return Err(crate::TrainError::Config(
                        "t_initial must be > 0 for cosine_warm".to_string(),
                    ));
                }
                if config.t_mult == 0 {
                    return Err(crate::TrainError::Config(
                        "t_mult must be > 0 for cosine_warm".to_string(),
                    ));
                }
                Self::CosineRestarts(CosineRestarts {
                    base_lr: config.lr,
                    min_lr: config.min_lr,
                    t_mult: config.t_mult,
                    t_cur: 0.0,
                    t_i: config.t_initial as f64,
                    step_size: 1.0 / steps_per_epoch as f64,
                })
            }
            ScheduleKind::Plateau => {
                if config.patience == 0 {
                    return Err(crate::TrainError::Config(
                        "patience must be > 0 for plateau".to_string(),
                    ));
                }
                Self::Plateau(Plateau {
                    current_lr: config.lr,
                    factor: config.decay_rate,
                    patience: config.patience,
                    min_lr: config.min_lr,
                    mode: config.plateau_mode,
                    best: match config.plateau_mode {
                        PlateauMode::Min => f64::INFINITY,
                        PlateauMode::Max => f64::NEG_INFINITY,
                    },
                    bad_epochs: 0,
                })
            }
            ScheduleKind::Constant => Self::Constant { lr: config.lr },
        };
        Ok(schedule)
    }

    /// The cadence this kind advances on
    pub fn cadence(&self) -> Cadence {
        match self {
            Self::OneCycle(_) | Self::CosineRestarts(_) => Cadence::PerStep,
            Self::Plateau(_) | Self::Constant { .. } => Cadence::PerEpoch,
        }
    }

    /// Learning rate at the current position
    pub fn current_lr(&self) -> f64 {
        match self {
            Self::OneCycle(s) => s.lr_at(s.step),
            Self::CosineRestarts(s) => {
                let cosine = 0.5 * (1.0 + (PI * s.t_cur / s.t_i).cos());
                s.min_lr + (s.base_lr - s.min_lr) * cosine
            }
            Self::Plateau(s) => s.current_lr,
            Self::Constant { lr } => *lr,
        }
    }

    /// React to an advancement event; events outside this kind's cadence are
    /// ignored.
    pub fn advance(&mut self, event: Advance) {
        match (self, event) {
            (Self::OneCycle(s), Advance::Step) => {
                s.step = (s.step + 1).min(s.total_steps);
            }
            (Self::CosineRestarts(s), Advance::Step) => {
                s.t_cur += s.step_size;
                s.consume_restarts();
            }
            (Self::Plateau(s), Advance::Epoch { val_loss }) => s.observe(val_loss),
            _ => {}
        }
    }

    /// Jump to the position an uninterrupted run would have after
    /// `epochs` full epochs; used on checkpoint resume.
    pub fn fast_forward(&mut self, epochs: usize) {
        match self {
            Self::OneCycle(s) => {
                s.step = (epochs * s.steps_per_epoch).min(s.total_steps);
            }
            Self::CosineRestarts(s) => {
                s.t_cur += epochs as f64;
                s.consume_restarts();
            }
            // plateau positions depend on metric history; the stored
            // checkpoint rate is restored via `restore_lr` instead
            Self::Plateau(_) | Self::Constant { .. } => {}
        }
    }

    /// Overwrite the current learning rate; only meaningful for plateau
    /// schedules, whose position cannot be recomputed from counters. Other
    /// kinds derive their rate from their counters and ignore this.
    pub fn restore_lr(&mut self, lr: f64) {
        if let Self::Plateau(s) = self {
            s.current_lr = lr;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: ScheduleKind) -> ScheduleConfig {
        ScheduleConfig {
            kind,
            lr: 0.01,
            min_lr: 0.0,
            epochs: 10,
            decay_rate: 0.1,
            t_initial: 2,
            t_mult: 1,
            plateau_mode: PlateauMode::Min,
            patience: 3,
        }
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("onecycle".parse::<ScheduleKind>().unwrap(), ScheduleKind::OneCycle);
        assert_eq!("cosine_warm".parse::<ScheduleKind>().unwrap(), ScheduleKind::CosineRestarts);
        assert_eq!("plateau".parse::<ScheduleKind>().unwrap(), ScheduleKind::Plateau);
        assert!("cyclic".parse::<ScheduleKind>().is_err());
    }

    #[test]
    fn test_onecycle_warms_up_then_anneals() {
        let mut sched = LrSchedule::new(&config(ScheduleKind::OneCycle), 10).unwrap();
        let total = 100usize;
        let warmup = 30usize;

        let start = sched.current_lr();
        assert!((start - 0.01 / 25.0).abs() < 1e-9);

        let mut lrs = Vec::new();
        for _ in 0..total {
            lrs.push(sched.current_lr());
            sched.advance(Advance::Step);
        }

        // strictly increasing through warmup
        for pair in lrs[..warmup].windows(2) {
            assert!(pair[1] > pair[0]);
        }
        // peak near the end of warmup, then decreasing
        assert!((lrs[warmup] - 0.01).abs() < 1e-3);
        for pair in lrs[warmup..].windows(2) {
            assert!(pair[1] <= pair[0]);
        }
        // ends near lr / final_div
        assert!(sched.current_lr() < 0.01 / 1e3);
    }

    #[test]
    fn test_onecycle_ignores_epoch_events() {
        let mut sched = LrSchedule::new(&config(ScheduleKind::OneCycle), 10).unwrap();
        let before = sched.current_lr();
        sched.advance(Advance::Epoch { val_loss: 0.5 });
        assert_eq!(sched.current_lr(), before);
        assert_eq!(sched.cadence(), Cadence::PerStep);
    }

    #[test]
    fn test_cosine_restarts_cycle_boundary() {
        // t_initial = 2 epochs, 4 steps per epoch
        let mut sched = LrSchedule::new(&config(ScheduleKind::CosineRestarts), 4).unwrap();

        assert!((sched.current_lr() - 0.01).abs() < 1e-12);

        // advance one full cycle: lr returns to the base rate
        for _ in 0..8 {
            sched.advance(Advance::Step);
        }
        assert!((sched.current_lr() - 0.01).abs() < 1e-9);

        // mid-cycle sits at the halfway cosine point
        for _ in 0..4 {
            sched.advance(Advance::Step);
        }
        assert!((sched.current_lr() - 0.005).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_restarts_t_mult_lengthens_cycles() {
        let mut cfg = config(ScheduleKind::CosineRestarts);
        cfg.t_mult = 2;
        let mut sched = LrSchedule::new(&cfg, 1).unwrap();

        // first cycle: 2 epochs; second cycle: 4 epochs
        for _ in 0..2 {
            sched.advance(Advance::Step);
        }
        assert!((sched.current_lr() - 0.01).abs() < 1e-9);
        // two epochs into the 4-epoch second cycle is its midpoint
        for _ in 0..2 {
            sched.advance(Advance::Step);
        }
        assert!((sched.current_lr() - 0.005).abs() < 1e-9);
    }

    #[test]
    fn test_plateau_reduces_after_patience() {
        let mut sched = LrSchedule::new(&config(ScheduleKind::Plateau), 10).unwrap();
        assert_eq!(sched.cadence(), Cadence::PerEpoch);

        // steps never move it
        sched.advance(Advance::Step);
        assert_eq!(sched.current_lr(), 0.01);

        // improving metric keeps the rate
        sched.advance(Advance::Epoch { val_loss: 1.0 });
        sched.advance(Advance::Epoch { val_loss: 0.9 });
        assert_eq!(sched.current_lr(), 0.01);

        // three stagnant epochs trigger the reduction
        sched.advance(Advance::Epoch { val_loss: 0.95 });
        sched.advance(Advance::Epoch { val_loss: 0.95 });
        assert_eq!(sched.current_lr(), 0.01);
        sched.advance(Advance::Epoch { val_loss: 0.95 });
        assert!((sched.current_lr() - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_plateau_respects_min_lr() {
        let mut cfg = config(ScheduleKind::Plateau);
        cfg.min_lr = 0.005;
        cfg.patience = 1;
        let mut sched = LrSchedule::new(&cfg, 10).unwrap();

        sched.advance(Advance::Epoch { val_loss: 1.0 });
        sched.advance(Advance::Epoch { val_loss: 1.0 });
        assert_eq!(sched.current_lr(), 0.005);
        sched.advance(Advance::Epoch { val_loss: 1.0 });
        assert_eq!(sched.current_lr(), 0.005);
    }

    #[test]
    fn test_resume_reproduces_onecycle_sequence() {
        let steps_per_epoch = 7;
        let cfg = config(ScheduleKind::OneCycle);

        // uninterrupted: two epochs of steps, recording the second epoch
        let mut continuous = LrSchedule::new(&cfg, steps_per_epoch).unwrap();
        for _ in 0..steps_per_epoch {
            continuous.advance(Advance::Step);
        }
        let mut expected = Vec::new();
        for _ in 0..steps_per_epoch {
            expected.push(continuous.current_lr());
            continuous.advance(Advance::Step);
        }

        // resumed: fresh schedule fast-forwarded past epoch 0
        let mut resumed = LrSchedule::new(&cfg, steps_per_epoch).unwrap();
        resumed.fast_forward(1);
        let mut actual = Vec::new();
        for _ in 0..steps_per_epoch {
            actual.push(resumed.current_lr());
            resumed.advance(Advance::Step);
        }

        assert_eq!(expected, actual);
    }

    #[test]
    fn test_resume_reproduces_cosine_sequence() {
        let steps_per_epoch = 5;
        let cfg = config(ScheduleKind::CosineRestarts);

        let mut continuous = LrSchedule::new(&cfg, steps_per_epoch).unwrap();
        for _ in 0..steps_per_epoch {
            continuous.advance(Advance::Step);
        }
        let mut expected = Vec::new();
        for _ in 0..steps_per_epoch {
            expected.push(continuous.current_lr());
            continuous.advance(Advance::Step);
        }

        let mut resumed = LrSchedule::new(&cfg, steps_per_epoch).unwrap();
        resumed.fast_forward(1);
        for (step, want) in expected.iter().enumerate() {
            let got = resumed.current_lr();
            assert!(
                (got - want).abs() < 1e-9,
                "step {}: resumed lr {} != continuous lr {}",
                step,
                got,
                want
            );
            resumed.advance(Advance::Step);
        }
    }

    #[test]
    fn test_restore_lr_only_touches_plateau() {
        let mut plateau = LrSchedule::new(&config(ScheduleKind::Plateau), 10).unwrap();
        plateau.restore_lr(0.002);
        assert_eq!(plateau.current_lr(), 0.002);

        let mut onecycle = LrSchedule::new(&config(ScheduleKind::OneCycle), 10).unwrap();
        let before = onecycle.current_lr();
        onecycle.restore_lr(0.002);
        assert_eq!(onecycle.current_lr(), before);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut cfg = config(ScheduleKind::CosineRestarts);
        cfg.t_initial = 0;
        assert!(LrSchedule::new(&cfg, 10).is_err());

        let mut cfg = config(ScheduleKind::Plateau);
        cfg.patience = 0;
        assert!(LrSchedule::new(&cfg, 10).is_err());

        assert!(LrSchedule::new(&config(ScheduleKind::Constant), 0).is_err());
    }
}
