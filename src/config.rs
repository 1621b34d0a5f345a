/// Configuration for one fine-tuning run
///
/// Snapshot of everything the run controller needs to decide what happens at
/// each epoch. Built once at process start, validated, then never mutated.
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::models;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Model identifier, e.g. "convnext_base"
    pub model: String,

    /// Dataset identifier; selects the run directory and the eval-only
    /// checkpoint name
    pub dataset: String,

    /// Free-form run tag appended to the run directory name
    pub tag: String,

    /// Number of training epochs
    pub epochs: usize,

    /// Per-step batch size
    pub batch_size: usize,

    /// Gradient accumulation factor (optimizer steps happen every
    /// `update_freq` batches)
    pub update_freq: usize,

    /// Peak learning rate (reached at the end of warmup)
    pub lr: f64,

    /// Learning rate at the end of the cosine decay
    pub min_lr: f64,

    /// Warmup length in epochs
    pub warmup_epochs: usize,

    /// Warmup length in steps; the effective warmup is the larger of the two
    pub warmup_steps: usize,

    /// Initial weight decay
    pub weight_decay: f64,

    /// Final weight decay; `None` keeps it constant
    pub weight_decay_end: Option<f64>,

    /// Layer-wise learning-rate decay rate; exactly 1.0 disables it
    pub layer_decay: f64,

    /// Maintain an EMA shadow of the model weights
    pub model_ema: bool,

    /// EMA decay rate
    pub model_ema_decay: f64,

    /// Evaluate the EMA shadow each epoch in addition to the primary model
    pub model_ema_eval: bool,

    /// Skip evaluation entirely during training
    pub disable_eval: bool,

    /// Write checkpoints at all
    pub save_ckpt: bool,

    /// Write an epoch-tagged checkpoint every N epochs
    pub save_ckpt_freq: usize,

    /// Root directory for run artifacts; the run writes into
    /// `<output_dir>/<dataset>_<tag>/`
    pub output_dir: PathBuf,

    /// Pretrained backbone weights to transfer before training
    pub finetune: Option<PathBuf>,

    /// `|`-separated top-level keys probed, in order, when loading a foreign
    /// weight artifact
    pub model_key: String,

    /// Name prefix applied to foreign weights before matching
    pub model_prefix: String,

    /// Evaluation-only mode: no schedule, no optimizer, no checkpoint writes
    pub eval_only: bool,

    /// Seed recorded for reproducibility and handed to collaborators
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: "convnext_base".to_string(),
            dataset: "cub200".to_string(),
            tag: "default".to_string(),
            epochs: 50,
            batch_size: 64,
            update_freq: 1,
            lr: 5e-4,
            min_lr: 1e-6,
            warmup_epochs: 5,
            warmup_steps: 0,
            weight_decay: 0.05,
            weight_decay_end: None,
            layer_decay: 1.0,
            model_ema: false,
            model_ema_decay: 0.9999,
            model_ema_eval: false,
            disable_eval: false,
            save_ckpt: true,
            save_ckpt_freq: 1,
            output_dir: PathBuf::from("output"),
            finetune: None,
            model_key: "model|module".to_string(),
            model_prefix: String::new(),
            eval_only: false,
            seed: 0,
        }
    }
}

impl RunConfig {
    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if !models::is_supported(&self.model) {
            return Err(crate::TrainError::Config(format!(
                "Unsupported model: {}",
                self.model
            )));
        }

        if self.epochs == 0 {
            return Err(crate::TrainError::Config(
                "epochs must be > 0".to_string(),
            ));
        }

        if self.batch_size == 0 || self.update_freq == 0 {
            return Err(crate::TrainError::Config(
                "batch_size and update_freq must be > 0".to_string(),
            ));
        }

        if self.min_lr > self.lr {
            return Err(crate::TrainError::Config(format!(
                "min_lr ({}) must not exceed lr ({})",
                self.min_lr, self.lr
            )));
        }

        if self.layer_decay <= 0.0 {
            return Err(crate::TrainError::Config(
                "layer_decay must be > 0".to_string(),
            ));
        }

        if self.model_ema_eval && !self.model_ema {
            return Err(crate::TrainError::Config(
                "model_ema_eval requires model_ema".to_string(),
            ));
        }

        if self.eval_only && self.disable_eval {
            return Err(crate::TrainError::Config(
                "eval_only and disable_eval are contradictory".to_string(),
            ));
        }

        if self.save_ckpt && self.save_ckpt_freq == 0 {
            return Err(crate::TrainError::Config(
                "save_ckpt_freq must be > 0 when save_ckpt is set".to_string(),
            ));
        }

        Ok(())
    }

    /// Directory all run artifacts (checkpoints, run log, config snapshot)
    /// are written into
    pub fn run_dir(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}", self.dataset, self.tag))
    }

    /// Final weight decay, defaulting to the initial value when unset
    pub fn effective_weight_decay_end(&self) -> f64 {
        self.weight_decay_end.unwrap_or(self.weight_decay)
    }

    /// Top-level keys probed in priority order when loading foreign weights
    pub fn accepted_model_keys(&self) -> Vec<&str> {
        self.model_key.split('|').collect()
    }

    /// Dump the full config as human-readable `key : value` lines.
    ///
    /// Written once at run start; not rewritten afterwards.
    pub fn write_snapshot(&self, dir: &Path) -> crate::Result<PathBuf> {
        let value = serde_json::to_value(self)?;
        let mut out = String::from("------------------ start ------------------\n");
        if let serde_json::Value::Object(map) = value {
            for (key, val) in map {
                out.push_str(&format!("{} : {}\n", key, val));
            }
        }
        out.push_str("------------------- end -------------------\n");

        fs::create_dir_all(dir)?;
        let path = dir.join("config.txt");
        fs::write(&path, out)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unsupported_model_rejected() {
        let config = RunConfig {
            model: "resnet50".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_contradictory_ema_flags_rejected() {
        let config = RunConfig {
            model_ema: false,
            model_ema_eval: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_lr_above_lr_rejected() {
        let config = RunConfig {
            lr: 1e-4,
            min_lr: 1e-3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_accepted_model_keys_order() {
        let config = RunConfig::default();
        assert_eq!(config.accepted_model_keys(), vec!["model", "module"]);
    }

    #[test]
    fn test_snapshot_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = RunConfig::default();
        let path = config.write_snapshot(dir.path())?;

        let text = fs::read_to_string(path)?;
        assert!(text.contains("model : \"convnext_base\""));
        assert!(text.starts_with("------------------ start"));
        Ok(())
    }
}
