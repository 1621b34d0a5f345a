/// Epoch driver for one fine-tuning run.
///
/// Owns the mutable training state and walks it through the epochs: train,
/// checkpoint on cadence, evaluate (primary then EMA shadow), persist new
/// bests, append one JSON record to the run log. The per-batch work happens
/// behind the [`Engine`] trait; a failure there aborts the run rather than
/// letting a silently partial epoch through.
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use candle_core::Device;
use serde::Serialize;

use crate::config::RunConfig;
use crate::models::ModelHandle;

use super::best::{BestRecord, BestTracker};
use super::checkpoint::{CheckpointStore, Tag};
use super::ema::{Ema, EmaConfig};
use super::layer_decay::LayerDecayAssigner;
use super::optimizer::{create_optimizer, GradScaler, GroupedAdamW};
use super::scheduler::Schedule;

/// Name of the append-only per-epoch log in the run directory
pub const RUN_LOG_FILE: &str = "record.txt";

/// Aggregate result of one evaluation pass
#[derive(Debug, Clone)]
pub struct EvalMetrics {
    /// Top-1 accuracy in percent
    pub acc1: f64,
    /// Top-5 accuracy in percent
    pub acc5: f64,
    /// Mean loss over the evaluation set
    pub loss: f64,
    /// Any further aggregates the engine reports
    pub extra: BTreeMap<String, f64>,
}

impl EvalMetrics {
    fn to_map(&self) -> BTreeMap<String, f64> {
        let mut map = self.extra.clone();
        map.insert("acc1".to_string(), self.acc1);
        map.insert("acc5".to_string(), self.acc5);
        map.insert("loss".to_string(), self.loss);
        map
    }
}

/// Per-epoch inputs handed to the external train step
pub struct TrainContext<'a> {
    /// Epoch being trained
    pub epoch: usize,
    /// Global step index of this epoch's first optimizer step
    pub start_step: usize,
    /// Learning rate per optimizer step of this epoch
    pub lr_schedule: &'a [f64],
    /// Weight decay per optimizer step of this epoch
    pub wd_schedule: &'a [f64],
}

/// External per-batch training and evaluation collaborator.
///
/// The controller blocks on these calls and treats their internals (data
/// prefetch, mixed precision, device placement) as opaque.
pub trait Engine {
    /// Optimizer steps in one full pass over the training data
    fn steps_per_epoch(&self) -> usize;

    /// One full pass over the training data. The engine applies the schedule
    /// slices step by step, drives the optimizer and scaler, and keeps the
    /// EMA shadow in lockstep with the primary weights.
    fn train_one_epoch(
        &mut self,
        model: &ModelHandle,
        optimizer: &mut GroupedAdamW,
        scaler: &mut GradScaler,
        ema: Option<&mut Ema>,
        ctx: &TrainContext<'_>,
    ) -> crate::Result<BTreeMap<String, f64>>;

    /// One full pass over the evaluation data. `Ok(None)` means the
    /// evaluation set yielded zero batches; the controller records the epoch
    /// without test metrics instead of aborting.
    fn evaluate(&mut self, model: &ModelHandle) -> crate::Result<Option<EvalMetrics>>;
}

/// The unit of checkpointing: everything a resumed process needs to continue
/// as if it had never stopped. Owned exclusively by the controller; resume
/// replaces it wholesale, never merges.
pub struct TrainingState {
    /// Next epoch to execute
    pub epoch: usize,
    pub model: ModelHandle,
    pub optimizer: GroupedAdamW,
    pub scaler: GradScaler,
    pub ema: Option<Ema>,
}

#[derive(Serialize)]
struct EpochLogEntry {
    epoch: usize,
    n_parameters: usize,
    #[serde(flatten)]
    metrics: BTreeMap<String, f64>,
}

/// What a completed run reports back
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub elapsed_secs: f64,
    pub best: BestRecord,
    pub epochs_run: usize,
}

/// Top-level run controller
pub struct RunController<E: Engine> {
    config: RunConfig,
    engine: E,
    state: TrainingState,
    schedule: Schedule,
    store: CheckpointStore,
    tracker: BestTracker,
    run_dir: PathBuf,
}

impl<E: Engine> RunController<E> {
    /// Wire up a run: write the config snapshot, transfer pretrained
    /// backbone weights if configured, build the optimizer (decay-aware when
    /// layer decay is active) and generate the full schedule.
    pub fn new(config: RunConfig, engine: E, model: ModelHandle, device: Device) -> crate::Result<Self> {
        config.validate()?;

        let run_dir = config.run_dir();
        fs::create_dir_all(&run_dir)?;
        config.write_snapshot(&run_dir)?;

        let store = CheckpointStore::new(&run_dir, device);

        if let Some(finetune) = &config.finetune {
            let keys = config.accepted_model_keys();
            store.load_foreign_weights(finetune, &model, &keys, &config.model_prefix)?;
        }

        // Exactly 1.0 means flat fine-tuning: one bucket, scale 1.0
        let assigner = (config.layer_decay != 1.0)
            .then(|| LayerDecayAssigner::for_convnext(config.layer_decay));
        let optimizer = create_optimizer(&config, &model, assigner.as_ref());

        let schedule = Schedule::from_config(&config, engine.steps_per_epoch());

        let ema = if config.model_ema {
            log::info!("Using EMA with decay = {:.8}", config.model_ema_decay);
            Some(Ema::from_model(
                EmaConfig {
                    decay: config.model_ema_decay,
                },
                &model,
            )?)
        } else {
            None
        };

        let state = TrainingState {
            epoch: 0,
            model,
            optimizer,
            scaler: GradScaler::default(),
            ema,
        };

        Ok(Self {
            config,
            engine,
            state,
            schedule,
            store,
            tracker: BestTracker::new(),
            run_dir,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn best_record(&self) -> BestRecord {
        self.tracker.record()
    }

    /// Execute the run: resume, iterate epochs, report elapsed time.
    ///
    /// In evaluation-only mode the loop is skipped entirely and the summary
    /// carries the single measured accuracy.
    pub fn run(&mut self) -> crate::Result<RunSummary> {
        if self.config.eval_only {
            let start = Instant::now();
            let acc1 = self.evaluate_only()?;
            return Ok(RunSummary {
                elapsed_secs: start.elapsed().as_secs_f64(),
                best: BestRecord {
                    primary: acc1,
                    ema: None,
                },
                epochs_run: 0,
            });
        }

        self.store.resume(&mut self.state)?;
        let start_epoch = self.state.epoch;
        let n_parameters = self.state.model.num_parameters();
        log::info!("Start training for {} epochs", self.config.epochs);
        log::info!("Number of params: {}", n_parameters);
        let start = Instant::now();

        for epoch in start_epoch..self.config.epochs {
            self.state.epoch = epoch;

            let ctx = TrainContext {
                epoch,
                start_step: epoch * self.schedule.steps_per_epoch(),
                lr_schedule: self.schedule.lr_for_epoch(epoch),
                wd_schedule: self.schedule.wd_for_epoch(epoch),
            };
            let train_stats = self.engine.train_one_epoch(
                &self.state.model,
                &mut self.state.optimizer,
                &mut self.state.scaler,
                self.state.ema.as_mut(),
                &ctx,
            )?;

            if self.should_save_epoch(epoch) {
                self.store.save(&self.state, &self.config, Tag::Epoch(epoch))?;
            }

            let mut metrics: BTreeMap<String, f64> = train_stats
                .into_iter()
                .map(|(key, value)| (format!("train_{}", key), value))
                .collect();

            if !self.config.disable_eval {
                self.evaluate_epoch(epoch, &mut metrics)?;
            }

            let entry = EpochLogEntry {
                epoch,
                n_parameters,
                metrics,
            };
            self.append_log(&entry)?;
        }

        let elapsed = start.elapsed();
        log::info!("Training time {}", format_duration(elapsed.as_secs()));
        Ok(RunSummary {
            elapsed_secs: elapsed.as_secs_f64(),
            best: self.tracker.record(),
            epochs_run: self.config.epochs - start_epoch,
        })
    }

    /// Pure inference path: load the dataset's named checkpoint restricted
    /// to the current model's keys and report a single accuracy figure. No
    /// schedule, no optimizer stepping, no checkpoint writes.
    pub fn evaluate_only(&mut self) -> crate::Result<f64> {
        let path = PathBuf::from("checkpoint").join(format!("{}.safetensors", self.config.dataset));
        let keys = self.config.accepted_model_keys();
        self.store.load_for_eval(&path, &self.state.model, &keys)?;

        match self.engine.evaluate(&self.state.model)? {
            Some(metrics) => {
                log::info!("Accuracy of the network on the test images: {:.5}%", metrics.acc1);
                Ok(metrics.acc1)
            }
            None => Err(crate::TrainError::Config(
                "evaluation-only run produced no evaluation batches".to_string(),
            )),
        }
    }

    fn should_save_epoch(&self, epoch: usize) -> bool {
        self.config.save_ckpt
            && ((epoch + 1) % self.config.save_ckpt_freq == 0 || epoch + 1 == self.config.epochs)
    }

    /// Evaluate primary and (optionally) EMA model, feed the tracker, act on
    /// save signals before the next epoch starts
    fn evaluate_epoch(
        &mut self,
        epoch: usize,
        metrics: &mut BTreeMap<String, f64>,
    ) -> crate::Result<()> {
        let primary = match self.engine.evaluate(&self.state.model)? {
            Some(primary) => primary,
            None => {
                // Empty evaluation set: skip, log the gap, leave test_*
                // fields absent rather than zero
                log::warn!("Evaluation yielded no batches at epoch {}; skipping test metrics", epoch);
                return Ok(());
            }
        };

        log::info!("test accuracy: {:.1}%", primary.acc1);
        for (key, value) in primary.to_map() {
            metrics.insert(format!("test_{}", key), value);
        }

        if self.tracker.observe_primary(primary.acc1).is_some() {
            if self.config.save_ckpt {
                self.store.save(&self.state, &self.config, Tag::Best)?;
            }
            log::info!("Max accuracy: {:.2}%", self.tracker.record().primary);
        }

        if self.config.model_ema && self.config.model_ema_eval {
            let ema_metrics = match &self.state.ema {
                Some(ema) => {
                    // Evaluate the shadow by swapping it into the model;
                    // primary weights are restored even when evaluation fails
                    let backup = ema.swap_into(&self.state.model)?;
                    let result = self.engine.evaluate(&self.state.model);
                    Ema::restore(&self.state.model, backup)?;
                    result?
                }
                None => None,
            };

            if let Some(ema_metrics) = ema_metrics {
                for (key, value) in ema_metrics.to_map() {
                    metrics.insert(format!("test_{}_ema", key), value);
                }
                if self.tracker.observe_ema(ema_metrics.acc1).is_some() {
                    if self.config.save_ckpt {
                        self.store.save(&self.state, &self.config, Tag::BestEma)?;
                    }
                    if let Some(best_ema) = self.tracker.record().ema {
                        log::info!("Max EMA accuracy: {:.2}%", best_ema);
                    }
                }
            }
        }

        Ok(())
    }

    /// Append one line to the run log; the file may be inspected while the
    /// run is still in progress
    fn append_log(&self, entry: &EpochLogEntry) -> crate::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir.join(RUN_LOG_FILE))?;
        writeln!(file, "{}", serde_json::to_string(entry)?)?;
        Ok(())
    }
}

fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{}:{:02}:{:02}", hours, minutes, seconds)
}
