/// Training orchestration: schedules, layer decay, checkpoints, best-model
/// tracking and the epoch driver
pub mod best;
pub mod checkpoint;
pub mod ema;
pub mod layer_decay;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use best::{BestRecord, BestTracker, SaveSignal};
pub use checkpoint::{CheckpointStore, ResumeOutcome, Tag};
pub use ema::{Ema, EmaConfig};
pub use layer_decay::LayerDecayAssigner;
pub use optimizer::{create_optimizer, GradScaler, GroupedAdamW};
pub use scheduler::{cosine_schedule, Schedule};
pub use trainer::{
    Engine, EvalMetrics, RunController, RunSummary, TrainContext, TrainingState,
};
