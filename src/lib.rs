//! Run controller for supervised image-classification fine-tuning.
//!
//! Wires together the pieces a fine-tuning run needs around the hot loop:
//! - eager cosine learning-rate / weight-decay schedules with warmup
//! - layer-wise learning-rate decay for pretrained backbones
//! - resumable, atomically written checkpoints (weights + optimizer + EMA)
//! - best-accuracy tracking for the primary model and its EMA shadow
//! - an epoch driver that appends one JSON record per epoch to a run log
//!
//! The network's forward/backward pass, dataset construction and the
//! per-batch step are collaborators supplied by the caller; see
//! [`training::Engine`] and [`data::DatasetProvider`].
//!
//! # Example
//!
//! ```ignore
//! use convnext_finetune::{RunConfig, training::RunController};
//!
//! let config = RunConfig::default();
//! config.validate()?;
//! let mut controller = RunController::new(config, engine, model)?;
//! let summary = controller.run()?;
//! println!("best acc1 {:.2}%", summary.best.primary);
//! ```

pub mod config;
pub mod data;
pub mod models;
pub mod training;

// Re-export commonly used items
pub use config::RunConfig;
pub use models::ModelHandle;

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A resume checkpoint exists but cannot be read back into a valid
    /// training state. Never silently downgraded to a fresh run.
    #[error("Corrupt checkpoint at {path}: {reason}")]
    CorruptCheckpoint { path: String, reason: String },

    /// A foreign weight artifact has a shape mismatch outside the
    /// classifier head.
    #[error("Incompatible checkpoint: {0}")]
    IncompatibleCheckpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrainError>;
