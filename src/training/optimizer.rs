/// Grouped AdamW optimizer with layer-wise learning-rate scales.
///
/// Adam with decoupled weight decay regularization, partitioned into
/// decay-aware parameter groups: each group carries a learning-rate
/// multiplier from the layer-decay assigner, and one-dimensional parameters
/// (biases, norm scales) are exempt from weight decay. Moment estimates are
/// kept per parameter name so they can travel through checkpoints.
use std::collections::{hash_map::Entry, BTreeMap, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::models::ModelHandle;

use super::layer_decay::LayerDecayAssigner;

/// AdamW moment hyperparameters; learning rate and weight decay are driven by
/// the schedule instead
#[derive(Debug, Clone)]
pub struct AdamWParams {
    /// Coefficient for the running average of gradients (beta1)
    pub beta1: f64,
    /// Coefficient for the running average of squared gradients (beta2)
    pub beta2: f64,
    /// Term added to the denominator for numerical stability
    pub eps: f64,
}

impl Default for AdamWParams {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// One decay-aware parameter group
pub struct ParamGroup {
    /// Depth bucket this group belongs to
    pub layer_id: usize,
    /// Learning-rate multiplier from the layer-decay assigner
    pub lr_scale: f64,
    /// Whether weight decay applies to this group
    pub apply_weight_decay: bool,
    vars: Vec<(String, Var)>,
}

impl ParamGroup {
    pub fn num_params(&self) -> usize {
        self.vars.len()
    }
}

/// Per-parameter moment state
#[derive(Debug, Clone)]
struct AdamState {
    /// First moment estimate
    m: Tensor,
    /// Second moment estimate
    v: Tensor,
}

/// AdamW over decay-aware parameter groups
///
/// Implements Adam with decoupled weight decay as described in
/// "Decoupled Weight Decay Regularization" (Loshchilov & Hutter, 2019)
pub struct GroupedAdamW {
    groups: Vec<ParamGroup>,
    states: HashMap<String, AdamState>,
    params: AdamWParams,
    lr: f64,
    weight_decay: f64,
    step_count: usize,
}

impl GroupedAdamW {
    pub fn new(groups: Vec<ParamGroup>, params: AdamWParams, lr: f64, weight_decay: f64) -> Self {
        Self {
            groups,
            states: HashMap::new(),
            params,
            lr,
            weight_decay,
            step_count: 0,
        }
    }

    /// Perform a single optimization step from precomputed gradients
    pub fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step_count += 1;
        let beta1 = self.params.beta1;
        let beta2 = self.params.beta2;
        let bias1 = 1.0 - beta1.powi(self.step_count as i32);
        let bias2 = 1.0 - beta2.powi(self.step_count as i32);

        for group in &self.groups {
            let lr = self.lr * group.lr_scale;
            let weight_decay = if group.apply_weight_decay {
                self.weight_decay
            } else {
                0.0
            };

            for (name, var) in &group.vars {
                let theta = var.as_tensor();
                let grad = match grads.get(theta) {
                    Some(grad) => grad,
                    None => continue,
                };

                let state = match self.states.entry(name.clone()) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let zeros = Tensor::zeros(theta.shape(), theta.dtype(), theta.device())?;
                        entry.insert(AdamState {
                            m: zeros.clone(),
                            v: zeros,
                        })
                    }
                };

                // m = beta1 * m + (1 - beta1) * grad
                state.m = ((&state.m * beta1)? + (grad * (1.0 - beta1))?)?;
                // v = beta2 * v + (1 - beta2) * grad^2
                state.v = ((&state.v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

                let m_hat = (&state.m / bias1)?;
                let v_hat = (&state.v / bias2)?;
                let update = ((m_hat / (v_hat.sqrt()? + self.params.eps)?)? * lr)?;

                // Decoupled decay: theta *= 1 - lr * wd, then apply the update
                let decayed = if weight_decay > 0.0 {
                    (theta * (1.0 - lr * weight_decay))?
                } else {
                    theta.clone()
                };
                var.set(&(decayed - update)?)?;
            }
        }

        Ok(())
    }

    /// Backward pass + parameter update in one call
    pub fn backward_step(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    /// Base learning rate (group scales are applied on top)
    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn weight_decay(&self) -> f64 {
        self.weight_decay
    }

    pub fn set_weight_decay(&mut self, weight_decay: f64) {
        self.weight_decay = weight_decay;
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Number of optimizer steps taken so far
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn set_step_count(&mut self, step_count: usize) {
        self.step_count = step_count;
    }

    /// Moment estimates as named tensors (`<param>.m` / `<param>.v`) for
    /// checkpointing
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut tensors = Vec::with_capacity(self.states.len() * 2);
        for (name, state) in &self.states {
            tensors.push((format!("{}.m", name), state.m.clone()));
            tensors.push((format!("{}.v", name), state.v.clone()));
        }
        tensors.sort_by(|a, b| a.0.cmp(&b.0));
        tensors
    }

    /// Restore moment estimates from checkpointed tensors; parameters without
    /// saved moments start fresh
    pub fn load_state(&mut self, tensors: &HashMap<String, Tensor>) -> candle_core::Result<()> {
        self.states.clear();
        for group in &self.groups {
            for (name, _) in &group.vars {
                let m = tensors.get(&format!("{}.m", name));
                let v = tensors.get(&format!("{}.v", name));
                if let (Some(m), Some(v)) = (m, v) {
                    self.states.insert(
                        name.clone(),
                        AdamState {
                            m: m.clone(),
                            v: v.clone(),
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

/// Partition a model's parameters into decay-aware groups.
///
/// Groups are keyed by `(layer_id, decays)`: one-dimensional tensors and
/// `.bias` entries never receive weight decay, and each depth bucket gets the
/// assigner's learning-rate scale. Without an assigner everything shares one
/// bucket at scale 1.0.
pub fn create_optimizer(
    config: &RunConfig,
    model: &ModelHandle,
    assigner: Option<&LayerDecayAssigner>,
) -> GroupedAdamW {
    let mut buckets: BTreeMap<(usize, bool), Vec<(String, Var)>> = BTreeMap::new();
    for (name, var) in model.named_vars() {
        let decays = var.dims().len() > 1 && !name.ends_with(".bias");
        let layer_id = assigner.map(|a| a.layer_id(&name)).unwrap_or(0);
        buckets.entry((layer_id, decays)).or_default().push((name, var));
    }

    let groups = buckets
        .into_iter()
        .map(|((layer_id, decays), vars)| ParamGroup {
            layer_id,
            lr_scale: assigner.map(|a| a.scale(layer_id)).unwrap_or(1.0),
            apply_weight_decay: decays,
            vars,
        })
        .collect();

    GroupedAdamW::new(groups, AdamWParams::default(), config.lr, config.weight_decay)
}

/// Dynamic loss-scale bookkeeping for mixed-precision training.
///
/// The per-batch step owns the actual scaling arithmetic; this struct owns the
/// state so it can travel through checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
    enabled: bool,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
            enabled: true,
        }
    }
}

impl GradScaler {
    /// A scaler that leaves losses untouched (full-precision runs)
    pub fn disabled() -> Self {
        Self {
            scale: 1.0,
            enabled: false,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Multiply a loss by the current scale
    pub fn scale_loss(&self, loss: &Tensor) -> candle_core::Result<Tensor> {
        if self.enabled {
            loss * self.scale
        } else {
            Ok(loss.clone())
        }
    }

    /// Advance the scale after a step: back off on overflow, grow after a
    /// streak of clean steps
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        }
    }
}
