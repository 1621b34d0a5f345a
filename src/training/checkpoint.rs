/// Checkpoint persistence with safetensors.
///
/// One artifact per tag, each a self-contained bundle: model weights,
/// optimizer moments and EMA shadow as namespaced tensors, epoch index and
/// scaler state in the header metadata. Writes go to a temp file in the same
/// directory and are renamed into place so a crash mid-save never clobbers
/// the previously valid artifact.
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use safetensors::SafeTensors;

use crate::config::RunConfig;
use crate::models::{self, ModelHandle};
use crate::TrainError;

use super::optimizer::GradScaler;
use super::trainer::TrainingState;

const MODEL_PREFIX: &str = "model.";
const OPT_PREFIX: &str = "opt.";
const EMA_PREFIX: &str = "ema.";

const META_EPOCH: &str = "epoch";
const META_OPT_STEP: &str = "opt_step";
const META_SCALER: &str = "scaler";
const META_CONFIG: &str = "config";

/// Closed vocabulary of checkpoint names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Cadence checkpoint for a completed epoch
    Epoch(usize),
    /// Best primary accuracy so far
    Best,
    /// Best EMA accuracy so far
    BestEma,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Epoch(epoch) => write!(f, "{}", epoch),
            Tag::Best => write!(f, "best"),
            Tag::BestEma => write!(f, "best-ema"),
        }
    }
}

/// Whether a resume found anything to pick up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// No checkpoint in the run directory; training starts at epoch 0
    Fresh,
    /// State replaced from the latest epoch checkpoint; `next_epoch` is the
    /// first epoch that still needs to run
    Resumed { next_epoch: usize },
}

/// Saves and restores [`TrainingState`] under tagged artifacts in one run
/// directory
pub struct CheckpointStore {
    dir: PathBuf,
    device: Device,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(dir: P, device: Device) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            device,
        }
    }

    /// Artifact path for a tag
    pub fn path_for(&self, tag: Tag) -> PathBuf {
        self.dir.join(format!("checkpoint-{}.safetensors", tag))
    }

    /// Serialize the full training state under `tag`, atomically replacing
    /// any prior artifact with the same tag
    pub fn save(&self, state: &TrainingState, config: &RunConfig, tag: Tag) -> crate::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let mut tensors: Vec<(String, Tensor)> = Vec::new();
        for (name, tensor) in state.model.weights() {
            tensors.push((format!("{}{}", MODEL_PREFIX, name), tensor));
        }
        for (name, tensor) in state.optimizer.state_tensors() {
            tensors.push((format!("{}{}", OPT_PREFIX, name), tensor));
        }
        if let Some(ema) = &state.ema {
            for (name, tensor) in ema.shadow_tensors() {
                tensors.push((format!("{}{}", EMA_PREFIX, name), tensor.clone()));
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert(META_EPOCH.to_string(), state.epoch.to_string());
        metadata.insert(
            META_OPT_STEP.to_string(),
            state.optimizer.step_count().to_string(),
        );
        metadata.insert(
            META_SCALER.to_string(),
            serde_json::to_string(&state.scaler)?,
        );
        metadata.insert(META_CONFIG.to_string(), serde_json::to_string(config)?);

        let path = self.path_for(tag);
        let tmp = path.with_extension("safetensors.tmp");
        safetensors::serialize_to_file(
            tensors.iter().map(|(name, tensor)| (name.as_str(), tensor)),
            &Some(metadata),
            &tmp,
        )
        .map_err(|e| {
            TrainError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("failed to serialize checkpoint: {}", e),
            ))
        })?;
        fs::rename(&tmp, &path)?;

        log::info!("Saved checkpoint {}", path.display());
        Ok(())
    }

    /// Look for the latest epoch checkpoint in the run directory and, if one
    /// exists, replace `state` with it wholesale.
    ///
    /// A missing checkpoint is the normal first-run case and leaves `state`
    /// untouched. An existing but unreadable or structurally incompatible
    /// artifact is a [`TrainError::CorruptCheckpoint`]; it is never silently
    /// downgraded to a fresh run.
    pub fn resume(&self, state: &mut TrainingState) -> crate::Result<ResumeOutcome> {
        let latest = match self.latest_epoch_checkpoint()? {
            Some(path) => path,
            None => {
                log::info!("No checkpoint under {}; starting fresh", self.dir.display());
                return Ok(ResumeOutcome::Fresh);
            }
        };

        let data = fs::read(&latest).map_err(|e| corrupt(&latest, e))?;
        let (_, header) = SafeTensors::read_metadata(&data).map_err(|e| corrupt(&latest, e))?;
        let metadata = header
            .metadata()
            .as_ref()
            .ok_or_else(|| corrupt(&latest, "missing header metadata"))?;

        let saved_epoch: usize = metadata
            .get(META_EPOCH)
            .ok_or_else(|| corrupt(&latest, "missing epoch metadata"))?
            .parse()
            .map_err(|e| corrupt(&latest, format!("bad epoch metadata: {}", e)))?;
        let opt_step: usize = metadata
            .get(META_OPT_STEP)
            .ok_or_else(|| corrupt(&latest, "missing opt_step metadata"))?
            .parse()
            .map_err(|e| corrupt(&latest, format!("bad opt_step metadata: {}", e)))?;
        let scaler_json = metadata
            .get(META_SCALER)
            .ok_or_else(|| corrupt(&latest, "missing scaler metadata"))?;
        let scaler: GradScaler = serde_json::from_str(scaler_json)
            .map_err(|e| corrupt(&latest, format!("bad scaler metadata: {}", e)))?;

        let tensors = candle_core::safetensors::load_buffer(&data, &self.device)
            .map_err(|e| corrupt(&latest, e))?;

        let mut model_weights = HashMap::new();
        let mut opt_state = HashMap::new();
        let mut ema_weights = HashMap::new();
        for (name, tensor) in tensors {
            if let Some(stripped) = name.strip_prefix(MODEL_PREFIX) {
                model_weights.insert(stripped.to_string(), tensor);
            } else if let Some(stripped) = name.strip_prefix(OPT_PREFIX) {
                opt_state.insert(stripped.to_string(), tensor);
            } else if let Some(stripped) = name.strip_prefix(EMA_PREFIX) {
                ema_weights.insert(stripped.to_string(), tensor);
            }
        }

        // The model's key set and the artifact's must agree exactly; a
        // partial overlap means the architecture changed under the run.
        for (name, _) in state.model.named_vars() {
            if !model_weights.contains_key(&name) {
                return Err(corrupt(&latest, format!("missing model key {}", name)));
            }
        }
        for (name, tensor) in &model_weights {
            match state.model.shape_of(name) {
                None => return Err(corrupt(&latest, format!("unexpected model key {}", name))),
                Some(shape) if shape != tensor.dims() => {
                    return Err(corrupt(
                        &latest,
                        format!(
                            "shape mismatch for {}: checkpoint {:?} vs model {:?}",
                            name,
                            tensor.dims(),
                            shape
                        ),
                    ));
                }
                Some(_) => {}
            }
        }
        for (name, tensor) in &model_weights {
            state.model.set_weight(name, tensor)?;
        }

        state.optimizer.load_state(&opt_state)?;
        state.optimizer.set_step_count(opt_step);
        state.scaler = scaler;

        if let Some(ema) = &mut state.ema {
            if ema_weights.is_empty() {
                return Err(corrupt(&latest, "EMA enabled but checkpoint has no EMA weights"));
            }
            ema.load(ema_weights);
        }

        // Continue from the first epoch the checkpoint did not cover
        state.epoch = saved_epoch + 1;
        log::info!(
            "Resumed from {} (epoch {}); continuing at epoch {}",
            latest.display(),
            saved_epoch,
            state.epoch
        );
        Ok(ResumeOutcome::Resumed {
            next_epoch: state.epoch,
        })
    }

    /// Transfer an externally produced weight artifact (a pretrained
    /// backbone) into the model.
    ///
    /// `preferred_keys` are tried in order as nested-table prefixes, falling
    /// back to treating the whole artifact as the weights table.
    /// Classifier-head entries whose shape disagrees with the current head
    /// are dropped; any other shape mismatch is fatal. Missing and extra
    /// keys are tolerated. Returns the number of applied tensors.
    pub fn load_foreign_weights(
        &self,
        path: &Path,
        model: &ModelHandle,
        preferred_keys: &[&str],
        prefix: &str,
    ) -> crate::Result<usize> {
        let data = fs::read(path)?;
        let tensors =
            candle_core::safetensors::load_buffer(&data, &self.device).map_err(|e| corrupt(path, e))?;
        let table = select_table(tensors, preferred_keys);

        // Validate before touching the model so a hard failure leaves the
        // initialized weights intact.
        let mut transfers: Vec<(String, Tensor)> = Vec::new();
        for (name, tensor) in table {
            let target = format!("{}{}", prefix, name);
            match model.shape_of(&target) {
                None => log::debug!("Skipping key {} absent from model", target),
                Some(shape) if shape == tensor.dims() => transfers.push((target, tensor)),
                Some(shape) => {
                    if models::is_head_key(&target) {
                        log::info!(
                            "Removing head key {} from pretrained checkpoint ({:?} vs {:?})",
                            target,
                            tensor.dims(),
                            shape
                        );
                    } else {
                        return Err(TrainError::IncompatibleCheckpoint(format!(
                            "shape mismatch for {}: checkpoint {:?} vs model {:?}",
                            target,
                            tensor.dims(),
                            shape
                        )));
                    }
                }
            }
        }

        for (name, tensor) in &transfers {
            model.set_weight(name, tensor)?;
        }
        log::info!(
            "Transferred {} weights from {}",
            transfers.len(),
            path.display()
        );
        Ok(transfers.len())
    }

    /// Load an artifact for evaluation-only mode, restricted to keys present
    /// in the current model. Shape mismatches are fatal here; evaluation on
    /// half-loaded weights would silently measure the wrong model.
    pub fn load_for_eval(
        &self,
        path: &Path,
        model: &ModelHandle,
        preferred_keys: &[&str],
    ) -> crate::Result<usize> {
        let data = fs::read(path)?;
        let tensors =
            candle_core::safetensors::load_buffer(&data, &self.device).map_err(|e| corrupt(path, e))?;
        let table = select_table(tensors, preferred_keys);

        let mut applied = 0;
        for (name, tensor) in table {
            let shape = match model.shape_of(&name) {
                Some(shape) => shape,
                None => continue,
            };
            if shape != tensor.dims() {
                return Err(TrainError::IncompatibleCheckpoint(format!(
                    "shape mismatch for {}: checkpoint {:?} vs model {:?}",
                    name,
                    tensor.dims(),
                    shape
                )));
            }
            model.set_weight(&name, &tensor)?;
            applied += 1;
        }
        Ok(applied)
    }

    fn latest_epoch_checkpoint(&self) -> crate::Result<Option<PathBuf>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let mut latest: Option<(usize, PathBuf)> = None;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(middle) = name
                .strip_prefix("checkpoint-")
                .and_then(|rest| rest.strip_suffix(".safetensors"))
            else {
                continue;
            };
            let Ok(epoch) = middle.parse::<usize>() else {
                continue; // best / best-ema are never resume sources
            };
            if latest.as_ref().map_or(true, |(e, _)| epoch > *e) {
                latest = Some((epoch, entry.path()));
            }
        }
        Ok(latest.map(|(_, path)| path))
    }
}

/// Pick the weights table out of an artifact: the first preferred key that
/// namespaces any tensor wins, otherwise the whole artifact is the table.
/// The probe order decides which artifacts load, so it is caller-visible.
fn select_table(
    tensors: HashMap<String, Tensor>,
    preferred_keys: &[&str],
) -> HashMap<String, Tensor> {
    for key in preferred_keys {
        let prefix = format!("{}.", key);
        if tensors.keys().any(|name| name.starts_with(&prefix)) {
            log::info!("Load weights table under key = {}", key);
            return tensors
                .into_iter()
                .filter_map(|(name, tensor)| {
                    name.strip_prefix(&prefix)
                        .map(|stripped| (stripped.to_string(), tensor))
                })
                .collect();
        }
    }
    tensors
}

fn corrupt(path: &Path, reason: impl ToString) -> TrainError {
    TrainError::CorruptCheckpoint {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::Init;

    use crate::training::ema::{Ema, EmaConfig};
    use crate::training::optimizer::create_optimizer;

    fn toy_state(head_dim: usize, body_init: f64, with_ema: bool) -> crate::Result<TrainingState> {
        let model = ModelHandle::new("convnext_base", head_dim)?;
        let device = Device::Cpu;
        model.varmap().get(
            (3, 3),
            "stages.0.0.dwconv.weight",
            Init::Const(body_init),
            DType::F32,
            &device,
        )?;
        model.varmap().get(
            (head_dim, 3),
            "head.weight",
            Init::Const(0.1),
            DType::F32,
            &device,
        )?;
        model
            .varmap()
            .get(head_dim, "head.bias", Init::Const(0.0), DType::F32, &device)?;

        let config = RunConfig::default();
        let optimizer = create_optimizer(&config, &model, None);
        let ema = with_ema
            .then(|| Ema::from_model(EmaConfig::default(), &model))
            .transpose()?;
        Ok(TrainingState {
            epoch: 0,
            model,
            optimizer,
            scaler: GradScaler::default(),
            ema,
        })
    }

    fn weight_values(state: &TrainingState, name: &str) -> crate::Result<Vec<f32>> {
        Ok(state.model.weights()[name].flatten_all()?.to_vec1::<f32>()?)
    }

    #[test]
    fn test_save_resume_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path(), Device::Cpu);
        let config = RunConfig::default();

        let mut state = toy_state(4, 2.5, true)?;
        state.epoch = 3;
        store.save(&state, &config, Tag::Epoch(3))?;

        // the temp file never outlives a successful save
        for entry in fs::read_dir(dir.path())? {
            let name = entry?.file_name();
            assert!(!name.to_string_lossy().ends_with(".tmp"));
        }

        let mut restored = toy_state(4, 0.0, true)?;
        let outcome = store.resume(&mut restored)?;
        assert_eq!(outcome, ResumeOutcome::Resumed { next_epoch: 4 });
        assert_eq!(restored.epoch, 4);

        // bit-identical weights
        assert_eq!(
            weight_values(&state, "stages.0.0.dwconv.weight")?,
            weight_values(&restored, "stages.0.0.dwconv.weight")?
        );
        Ok(())
    }

    #[test]
    fn test_missing_checkpoint_starts_fresh() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path(), Device::Cpu);

        let mut state = toy_state(4, 1.0, false)?;
        assert_eq!(store.resume(&mut state)?, ResumeOutcome::Fresh);
        assert_eq!(state.epoch, 0);
        Ok(())
    }

    #[test]
    fn test_unreadable_checkpoint_is_corrupt() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path(), Device::Cpu);
        fs::write(dir.path().join("checkpoint-1.safetensors"), b"not a checkpoint")?;

        let mut state = toy_state(4, 1.0, false)?;
        let err = store.resume(&mut state).unwrap_err();
        assert!(matches!(err, TrainError::CorruptCheckpoint { .. }));
        Ok(())
    }

    #[test]
    fn test_resume_picks_latest_epoch() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path(), Device::Cpu);
        let config = RunConfig::default();

        let mut state = toy_state(4, 1.0, false)?;
        state.epoch = 1;
        store.save(&state, &config, Tag::Epoch(1))?;
        state.epoch = 3;
        store.save(&state, &config, Tag::Epoch(3))?;
        // best artifacts never participate in resume
        state.epoch = 9;
        store.save(&state, &config, Tag::Best)?;

        let mut restored = toy_state(4, 0.0, false)?;
        let outcome = store.resume(&mut restored)?;
        assert_eq!(outcome, ResumeOutcome::Resumed { next_epoch: 4 });
        Ok(())
    }

    #[test]
    fn test_foreign_load_drops_mismatched_head() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path(), Device::Cpu);
        let device = Device::Cpu;

        // pretrained artifact with a 1000-way head; ours has 200 classes
        let mut pretrained = HashMap::new();
        pretrained.insert(
            "model.head.weight".to_string(),
            Tensor::full(9.0f32, (1000, 3), &device)?,
        );
        pretrained.insert(
            "model.head.bias".to_string(),
            Tensor::full(9.0f32, 1000, &device)?,
        );
        pretrained.insert(
            "model.stages.0.0.dwconv.weight".to_string(),
            Tensor::full(7.0f32, (3, 3), &device)?,
        );
        let path = dir.path().join("pretrained.safetensors");
        candle_core::safetensors::save(&pretrained, &path)?;

        let state = toy_state(200, 0.0, false)?;
        let applied =
            store.load_foreign_weights(&path, &state.model, &["model", "module"], "")?;
        assert_eq!(applied, 1);

        // backbone transferred, head left at its initialized value
        assert_eq!(
            weight_values(&state, "stages.0.0.dwconv.weight")?,
            vec![7.0; 9]
        );
        let head = weight_values(&state, "head.weight")?;
        assert!(head.iter().all(|v| (*v - 0.1).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_foreign_nonhead_mismatch_is_fatal() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path(), Device::Cpu);
        let device = Device::Cpu;

        let mut pretrained = HashMap::new();
        pretrained.insert(
            "model.stages.0.0.dwconv.weight".to_string(),
            Tensor::full(7.0f32, (5, 5), &device)?,
        );
        let path = dir.path().join("pretrained.safetensors");
        candle_core::safetensors::save(&pretrained, &path)?;

        let state = toy_state(4, 0.0, false)?;
        let err = store
            .load_foreign_weights(&path, &state.model, &["model"], "")
            .unwrap_err();
        assert!(matches!(err, TrainError::IncompatibleCheckpoint(_)));
        Ok(())
    }

    #[test]
    fn test_foreign_load_falls_back_to_whole_artifact() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path(), Device::Cpu);
        let device = Device::Cpu;

        // no "model."/"module." namespace: the artifact itself is the table
        let mut pretrained = HashMap::new();
        pretrained.insert(
            "stages.0.0.dwconv.weight".to_string(),
            Tensor::full(4.0f32, (3, 3), &device)?,
        );
        let path = dir.path().join("flat.safetensors");
        candle_core::safetensors::save(&pretrained, &path)?;

        let state = toy_state(4, 0.0, false)?;
        let applied =
            store.load_foreign_weights(&path, &state.model, &["model", "module"], "")?;
        assert_eq!(applied, 1);
        assert_eq!(
            weight_values(&state, "stages.0.0.dwconv.weight")?,
            vec![4.0; 9]
        );
        Ok(())
    }

    #[test]
    fn test_load_for_eval_restricts_to_model_keys() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path(), Device::Cpu);
        let config = RunConfig::default();

        let mut state = toy_state(4, 6.0, false)?;
        state.epoch = 0;
        store.save(&state, &config, Tag::Epoch(0))?;

        // fresh model with fewer keys than the artifact carries (the
        // artifact also holds optimizer moments under their own namespace)
        let target = toy_state(4, 0.0, false)?;
        let applied = store.load_for_eval(
            &store.path_for(Tag::Epoch(0)),
            &target.model,
            &["model", "module"],
        )?;
        assert_eq!(applied, 3);
        assert_eq!(
            weight_values(&target, "stages.0.0.dwconv.weight")?,
            vec![6.0; 9]
        );
        Ok(())
    }

    #[test]
    fn test_resume_requires_ema_when_enabled() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CheckpointStore::new(dir.path(), Device::Cpu);
        let config = RunConfig::default();

        let mut state = toy_state(4, 1.0, false)?;
        state.epoch = 0;
        store.save(&state, &config, Tag::Epoch(0))?;

        let mut with_ema = toy_state(4, 0.0, true)?;
        let err = store.resume(&mut with_ema).unwrap_err();
        assert!(matches!(err, TrainError::CorruptCheckpoint { .. }));
        Ok(())
    }
}
