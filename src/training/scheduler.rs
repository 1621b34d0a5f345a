/// Cosine schedules with warmup, generated eagerly for the whole run.
///
/// The full per-step sequence is materialized before the first epoch so a
/// resumed run can index straight into it by global step instead of replaying
/// earlier epochs.
use std::f64::consts::PI;

use crate::config::RunConfig;

/// Generate one per-step value sequence of length `epochs * steps_per_epoch`.
///
/// Linear ramp from 0 to `base_value` over
/// `max(warmup_epochs * steps_per_epoch, warmup_steps)` steps, then a
/// half-cosine decay from `base_value` to `end_value` over the remaining
/// steps. A warmup covering the whole run yields a truncated, warmup-only
/// sequence.
pub fn cosine_schedule(
    base_value: f64,
    end_value: f64,
    epochs: usize,
    steps_per_epoch: usize,
    warmup_epochs: usize,
    warmup_steps: usize,
) -> Vec<f64> {
    let total_steps = epochs * steps_per_epoch;
    let warmup_iters = (warmup_epochs * steps_per_epoch).max(warmup_steps);
    let warmup_emitted = warmup_iters.min(total_steps);

    let mut schedule = Vec::with_capacity(total_steps);

    // Ramp over the full warmup length even when the run ends inside it.
    for i in 0..warmup_emitted {
        let value = if warmup_iters > 1 {
            base_value * i as f64 / (warmup_iters - 1) as f64
        } else {
            0.0
        };
        schedule.push(value);
    }

    let decay_steps = total_steps - warmup_emitted;
    for i in 0..decay_steps {
        let progress = i as f64 / decay_steps as f64;
        let cosine_factor = 0.5 * (1.0 + (PI * progress).cos());
        schedule.push(end_value + (base_value - end_value) * cosine_factor);
    }

    debug_assert_eq!(schedule.len(), total_steps);
    schedule
}

/// The run's precomputed learning-rate and weight-decay sequences, one entry
/// per optimizer step, indexed by `epoch * steps_per_epoch + local_step`.
#[derive(Debug, Clone)]
pub struct Schedule {
    lr: Vec<f64>,
    wd: Vec<f64>,
    steps_per_epoch: usize,
}

impl Schedule {
    /// Build both sequences from the run configuration.
    ///
    /// The weight-decay sequence uses the same cosine shape with warmup
    /// disabled and its own bounds.
    pub fn from_config(config: &RunConfig, steps_per_epoch: usize) -> Self {
        let lr = cosine_schedule(
            config.lr,
            config.min_lr,
            config.epochs,
            steps_per_epoch,
            config.warmup_epochs,
            config.warmup_steps,
        );
        let wd = cosine_schedule(
            config.weight_decay,
            config.effective_weight_decay_end(),
            config.epochs,
            steps_per_epoch,
            0,
            0,
        );
        Self {
            lr,
            wd,
            steps_per_epoch,
        }
    }

    pub fn total_steps(&self) -> usize {
        self.lr.len()
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    /// Learning rate at a global step (clamped to the final value past the
    /// end)
    pub fn lr_at(&self, global_step: usize) -> f64 {
        let idx = global_step.min(self.lr.len().saturating_sub(1));
        self.lr[idx]
    }

    /// Per-step learning rates for one epoch
    pub fn lr_for_epoch(&self, epoch: usize) -> &[f64] {
        Self::epoch_slice(&self.lr, epoch, self.steps_per_epoch)
    }

    /// Per-step weight decays for one epoch
    pub fn wd_for_epoch(&self, epoch: usize) -> &[f64] {
        Self::epoch_slice(&self.wd, epoch, self.steps_per_epoch)
    }

    fn epoch_slice(values: &[f64], epoch: usize, steps_per_epoch: usize) -> &[f64] {
        let start = (epoch * steps_per_epoch).min(values.len());
        let end = (start + steps_per_epoch).min(values.len());
        &values[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_length() {
        let schedule = cosine_schedule(0.1, 0.0, 10, 100, 1, 0);
        assert_eq!(schedule.len(), 1000);
    }

    #[test]
    fn test_warmup_endpoints() {
        // 10 epochs x 100 steps, 1 warmup epoch
        let schedule = cosine_schedule(0.1, 0.0, 10, 100, 1, 0);

        assert!((schedule[0] - 0.0).abs() < 1e-9);
        assert!((schedule[99] - 0.1).abs() < 1e-6);
        assert!((schedule[999] - 0.0).abs() < 1e-3);
    }

    #[test]
    fn test_warmup_monotone_nondecreasing() {
        let schedule = cosine_schedule(1.0, 0.0, 10, 100, 2, 0);
        for window in schedule[..200].windows(2) {
            assert!(window[1] >= window[0]);
        }
    }

    #[test]
    fn test_decay_monotone_nonincreasing_without_warmup() {
        let schedule = cosine_schedule(1.0, 0.1, 10, 100, 0, 0);
        assert!((schedule[0] - 1.0).abs() < 1e-9);
        for window in schedule.windows(2) {
            assert!(window[1] <= window[0] + 1e-12);
        }
    }

    #[test]
    fn test_warmup_steps_override_when_larger() {
        // warmup_steps=300 beats warmup_epochs*steps_per_epoch=100
        let schedule = cosine_schedule(1.0, 0.0, 10, 100, 1, 300);
        // still inside the ramp at step 150
        assert!(schedule[150] < 1.0);
        assert!((schedule[299] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_warmup_covering_run_truncates() {
        let schedule = cosine_schedule(1.0, 0.0, 1, 100, 5, 0);
        assert_eq!(schedule.len(), 100);
        // pure ramp, never reaches base
        for window in schedule.windows(2) {
            assert!(window[1] > window[0]);
        }
        assert!(schedule[99] < 1.0);
    }

    #[test]
    fn test_wd_schedule_starts_at_base() {
        let config = RunConfig {
            weight_decay: 0.05,
            weight_decay_end: Some(0.01),
            epochs: 4,
            ..Default::default()
        };
        let schedule = Schedule::from_config(&config, 50);
        assert!((schedule.wd_for_epoch(0)[0] - 0.05).abs() < 1e-9);
        let last = *schedule.wd_for_epoch(3).last().unwrap();
        assert!((last - 0.01).abs() < 1e-3);
    }

    #[test]
    fn test_epoch_slices() {
        let config = RunConfig {
            epochs: 3,
            warmup_epochs: 0,
            warmup_steps: 0,
            ..Default::default()
        };
        let schedule = Schedule::from_config(&config, 10);
        assert_eq!(schedule.total_steps(), 30);
        assert_eq!(schedule.lr_for_epoch(0).len(), 10);
        assert_eq!(schedule.lr_for_epoch(2).len(), 10);
        assert_eq!(schedule.lr_for_epoch(1)[0], schedule.lr_at(10));
        // out-of-range epochs yield an empty slice rather than panicking
        assert!(schedule.lr_for_epoch(5).is_empty());
    }
}
