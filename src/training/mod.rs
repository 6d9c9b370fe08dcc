/// Training infrastructure: the epoch loop and everything around it

pub mod checkpoint;
pub mod cutmix;
pub mod metrics;
pub mod optimizer;
pub mod run;
pub mod scheduler;
pub mod trainer;
pub mod validator;

pub use checkpoint::{Checkpoint, CheckpointMetadata};
pub use cutmix::CutMixConfig;
pub use metrics::{EpochRecord, MetricsLog};
pub use optimizer::{create_optimizer, OptimizerConfig, OptimizerKind, TrainOptimizer};
pub use run::{RunConfig, RunSummary, TrainingRun};
pub use scheduler::{Advance, Cadence, LrSchedule, PlateauMode, ScheduleConfig, ScheduleKind};
pub use trainer::{train_one_epoch, EpochReport, EpochStats, TrainLoopConfig};
pub use validator::validate;
