/// Exponential Moving Average of model weights
///
/// Maintains a shadow copy of every model parameter, keyed by parameter name
/// so the shadow can travel through checkpoints and be swapped into the model
/// for a separate evaluation pass.
use std::collections::{hash_map::Entry, HashMap};

use candle_core::{Result, Tensor};

use crate::models::ModelHandle;

/// EMA configuration
#[derive(Debug, Clone)]
pub struct EmaConfig {
    /// Decay rate for the moving average:
    /// `shadow = decay * shadow + (1 - decay) * weight`
    pub decay: f64,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self { decay: 0.9999 }
    }
}

/// Exponential moving average of a model's named parameters
pub struct Ema {
    config: EmaConfig,
    shadow: HashMap<String, Tensor>,
}

impl Ema {
    /// Create an empty EMA; shadows are seeded on first update
    pub fn new(config: EmaConfig) -> Self {
        Self {
            config,
            shadow: HashMap::new(),
        }
    }

    /// Create an EMA seeded from the model's current weights
    pub fn from_model(config: EmaConfig, model: &ModelHandle) -> Result<Self> {
        let mut ema = Self::new(config);
        ema.shadow = model.weights();
        Ok(ema)
    }

    pub fn decay(&self) -> f64 {
        self.config.decay
    }

    /// Fold the model's current weights into the shadow
    pub fn update(&mut self, model: &ModelHandle) -> Result<()> {
        let decay = self.config.decay;
        for (name, var) in model.named_vars() {
            let param = var.as_tensor();
            match self.shadow.entry(name) {
                Entry::Occupied(mut entry) => {
                    let shadow = entry.get_mut();
                    *shadow = ((&*shadow * decay)? + (param * (1.0 - decay))?)?;
                }
                Entry::Vacant(entry) => {
                    // First sighting seeds the shadow at the parameter value
                    entry.insert(param.clone());
                }
            }
        }
        Ok(())
    }

    /// Shadow tensors keyed by parameter name
    pub fn shadow_tensors(&self) -> &HashMap<String, Tensor> {
        &self.shadow
    }

    /// Replace the shadow wholesale (checkpoint resume)
    pub fn load(&mut self, tensors: HashMap<String, Tensor>) {
        self.shadow = tensors;
    }

    /// Swap shadow weights into the model, returning the displaced primary
    /// weights so [`Ema::restore`] can put them back after evaluation
    pub fn swap_into(&self, model: &ModelHandle) -> crate::Result<Vec<(String, Tensor)>> {
        let mut backup = Vec::with_capacity(self.shadow.len());
        for (name, var) in model.named_vars() {
            if let Some(shadow) = self.shadow.get(&name) {
                backup.push((name.clone(), var.as_tensor().clone()));
                var.set(shadow)?;
            }
        }
        Ok(backup)
    }

    /// Undo a [`Ema::swap_into`], restoring the primary weights
    pub fn restore(model: &ModelHandle, backup: Vec<(String, Tensor)>) -> crate::Result<()> {
        for (name, tensor) in backup {
            model.set_weight(&name, &tensor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::Init;

    fn model_with_weight(value: f64) -> crate::Result<ModelHandle> {
        let model = ModelHandle::new("convnext_base", 2)?;
        model.varmap().get(
            (5, 5),
            "stem.weight",
            Init::Const(value),
            DType::F32,
            &Device::Cpu,
        )?;
        Ok(model)
    }

    #[test]
    fn test_first_update_seeds_shadow() -> crate::Result<()> {
        let model = model_with_weight(1.0)?;
        let mut ema = Ema::new(EmaConfig { decay: 0.9 });
        ema.update(&model)?;

        let shadow = &ema.shadow_tensors()["stem.weight"];
        let mean = shadow.mean_all()?.to_scalar::<f32>()?;
        assert!((mean - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_smoothing() -> crate::Result<()> {
        let model = model_with_weight(1.0)?;
        let mut ema = Ema::new(EmaConfig { decay: 0.9 });
        ema.update(&model)?;

        // Move weights to zero; shadow should land at decay * 1 + (1-decay) * 0
        let zeros = Tensor::zeros((5, 5), DType::F32, &Device::Cpu)?;
        model.set_weight("stem.weight", &zeros)?;
        ema.update(&model)?;

        let mean = ema.shadow_tensors()["stem.weight"]
            .mean_all()?
            .to_scalar::<f32>()?;
        assert!((mean - 0.9).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_swap_and_restore() -> crate::Result<()> {
        let model = model_with_weight(1.0)?;
        let mut ema = Ema::from_model(EmaConfig { decay: 0.5 }, &model)?;

        let twos = Tensor::full(2.0f32, (5, 5), &Device::Cpu)?;
        model.set_weight("stem.weight", &twos)?;
        ema.update(&model)?; // shadow = 0.5 * 1 + 0.5 * 2 = 1.5

        let backup = ema.swap_into(&model)?;
        let swapped = model.weights()["stem.weight"]
            .mean_all()?
            .to_scalar::<f32>()?;
        assert!((swapped - 1.5).abs() < 1e-6);

        Ema::restore(&model, backup)?;
        let restored = model.weights()["stem.weight"]
            .mean_all()?
            .to_scalar::<f32>()?;
        assert!((restored - 2.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_load_replaces_shadow() -> crate::Result<()> {
        let model = model_with_weight(1.0)?;
        let mut ema = Ema::from_model(EmaConfig::default(), &model)?;

        let mut replacement = HashMap::new();
        replacement.insert(
            "stem.weight".to_string(),
            Tensor::full(7.0f32, (5, 5), &Device::Cpu)?,
        );
        ema.load(replacement);

        let mean = ema.shadow_tensors()["stem.weight"]
            .mean_all()?
            .to_scalar::<f32>()?;
        assert!((mean - 7.0).abs() < 1e-6);
        Ok(())
    }
}
