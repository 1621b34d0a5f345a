/// Model handle: the named-parameter view the run controller works through.
///
/// The network's layers and forward pass live in an external collaborator;
/// the controller only needs the parameter table (for checkpointing, EMA,
/// optimizer grouping and weight transfer) plus the classifier-head names it
/// is allowed to drop when class counts differ.
use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

/// Model identifiers the run controller knows how to drive
pub const SUPPORTED_ARCHS: &[&str] = &[
    "convnext_tiny",
    "convnext_small",
    "convnext_base",
    "convnext_large",
];

/// Classifier-head parameter names; shape mismatches under these names are
/// dropped during backbone transfer instead of failing the load
pub const HEAD_KEYS: &[&str] = &["head.weight", "head.bias"];

/// Whether a model identifier is recognized
pub fn is_supported(arch: &str) -> bool {
    SUPPORTED_ARCHS.contains(&arch)
}

/// Whether a parameter name belongs to the classifier head
pub fn is_head_key(name: &str) -> bool {
    HEAD_KEYS.contains(&name)
}

/// A model as seen by the run controller: an architecture identifier, a class
/// count, and the named parameter table the external network builder
/// populates through [`ModelHandle::var_builder`].
pub struct ModelHandle {
    arch: String,
    num_classes: usize,
    varmap: VarMap,
}

impl ModelHandle {
    /// Create a handle for a supported architecture with an empty parameter
    /// table
    pub fn new(arch: &str, num_classes: usize) -> crate::Result<Self> {
        if !is_supported(arch) {
            return Err(crate::TrainError::Config(format!(
                "Unsupported model: {}",
                arch
            )));
        }
        Ok(Self {
            arch: arch.to_string(),
            num_classes,
            varmap: VarMap::new(),
        })
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Builder the external network constructor registers parameters through
    pub fn var_builder(&self, dtype: DType, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, dtype, device)
    }

    /// All parameters as (name, var) pairs, sorted by name for deterministic
    /// iteration
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().unwrap();
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    /// Snapshot of all parameter tensors keyed by name
    pub fn weights(&self) -> HashMap<String, Tensor> {
        let data = self.varmap.data().lock().unwrap();
        data.iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    }

    /// Look up one parameter by name
    pub fn var(&self, name: &str) -> Option<Var> {
        let data = self.varmap.data().lock().unwrap();
        data.get(name).cloned()
    }

    /// Shape of a named parameter, if present
    pub fn shape_of(&self, name: &str) -> Option<Vec<usize>> {
        self.var(name).map(|v| v.dims().to_vec())
    }

    /// Overwrite one parameter in place; `Ok(false)` when the model has no
    /// parameter under that name
    pub fn set_weight(&self, name: &str, value: &Tensor) -> crate::Result<bool> {
        match self.var(name) {
            Some(var) => {
                var.set(value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Total number of trainable scalar parameters
    pub fn num_parameters(&self) -> usize {
        let data = self.varmap.data().lock().unwrap();
        data.values()
            .map(|var| var.dims().iter().product::<usize>())
            .sum()
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("arch", &self.arch)
            .field("num_classes", &self.num_classes)
            .field("num_parameters", &self.num_parameters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::Init;

    fn toy_model() -> crate::Result<ModelHandle> {
        let model = ModelHandle::new("convnext_base", 10)?;
        let device = Device::Cpu;
        model
            .varmap()
            .get((4, 3), "stem.weight", Init::Const(1.0), DType::F32, &device)?;
        model
            .varmap()
            .get((10, 4), "head.weight", Init::Const(0.5), DType::F32, &device)?;
        model
            .varmap()
            .get(10, "head.bias", Init::Const(0.0), DType::F32, &device)?;
        Ok(model)
    }

    #[test]
    fn test_unsupported_arch_rejected() {
        assert!(ModelHandle::new("resnet50", 10).is_err());
    }

    #[test]
    fn test_parameter_count() -> crate::Result<()> {
        let model = toy_model()?;
        assert_eq!(model.num_parameters(), 4 * 3 + 10 * 4 + 10);
        Ok(())
    }

    #[test]
    fn test_named_vars_sorted() -> crate::Result<()> {
        let model = toy_model()?;
        let names: Vec<String> = model.named_vars().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["head.bias", "head.weight", "stem.weight"]);
        Ok(())
    }

    #[test]
    fn test_set_weight() -> crate::Result<()> {
        let model = toy_model()?;
        let device = Device::Cpu;
        let new = Tensor::full(2.0f32, (4, 3), &device)?;
        assert!(model.set_weight("stem.weight", &new)?);
        assert!(!model.set_weight("missing.weight", &new)?);

        let stored = model.var("stem.weight").unwrap();
        let val = stored.as_tensor().mean_all()?.to_scalar::<f32>()?;
        assert!((val - 2.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_head_keys() {
        assert!(is_head_key("head.weight"));
        assert!(is_head_key("head.bias"));
        assert!(!is_head_key("stem.weight"));
    }
}
