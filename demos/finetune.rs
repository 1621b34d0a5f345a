/// Synthetic end-to-end run of the fine-tuning controller.
///
/// A least-squares head stands in for the network: the engine regresses a
/// weight matrix against deterministic in-memory batches and reports an
/// accuracy derived from the remaining evaluation loss. Everything else —
/// schedules, layer decay, EMA, checkpoints, the run log — is the real
/// controller, so a second invocation resumes from the saved epoch.
use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::Init;

use convnext_finetune::data::{BatchDataLoader, DatasetProvider};
use convnext_finetune::training::{
    Ema, Engine, EvalMetrics, GradScaler, GroupedAdamW, RunController, TrainContext,
};
use convnext_finetune::{ModelHandle, RunConfig, TrainError};

const FEATURES: usize = 8;
const CLASSES: usize = 4;
const BATCH: usize = 4;

/// Deterministic in-memory batches
struct VectorLoader {
    batches: Vec<(Tensor, Tensor)>,
    cursor: usize,
}

impl BatchDataLoader for VectorLoader {
    fn next_batch(&mut self, device: &Device) -> candle_core::Result<Option<(Tensor, Tensor)>> {
        let Some((input, target)) = self.batches.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        Ok(Some((input.to_device(device)?, target.to_device(device)?)))
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn num_batches(&self) -> usize {
        self.batches.len()
    }
}

struct VectorProvider {
    device: Device,
}

impl DatasetProvider for VectorProvider {
    type Loader = VectorLoader;

    fn build_dataset(&self, is_train: bool) -> convnext_finetune::Result<(VectorLoader, usize)> {
        let num_batches = if is_train { 8 } else { 2 };
        let mut batches = Vec::with_capacity(num_batches);
        for batch_idx in 0..num_batches {
            let input: Vec<f32> = (0..BATCH * FEATURES)
                .map(|i| ((batch_idx * 31 + i * 7) % 13) as f32 / 13.0)
                .collect();
            let target: Vec<f32> = (0..BATCH * CLASSES)
                .map(|i| ((batch_idx * 17 + i * 5) % 11) as f32 / 11.0)
                .collect();
            batches.push((
                Tensor::from_vec(input, (BATCH, FEATURES), &self.device)?,
                Tensor::from_vec(target, (BATCH, CLASSES), &self.device)?,
            ));
        }
        Ok((
            VectorLoader { batches, cursor: 0 },
            CLASSES,
        ))
    }
}

/// Least-squares "network": predictions are `input @ head.weight^T`
struct LeastSquaresEngine {
    train_loader: VectorLoader,
    eval_loader: VectorLoader,
    device: Device,
}

impl LeastSquaresEngine {
    fn batch_loss(model: &ModelHandle, input: &Tensor, target: &Tensor) -> convnext_finetune::Result<Tensor> {
        let head = model
            .var("head.weight")
            .ok_or_else(|| TrainError::Config("model has no head.weight".to_string()))?;
        let pred = input.matmul(&head.as_tensor().t()?)?;
        Ok((pred - target)?.sqr()?.mean_all()?)
    }
}

impl Engine for LeastSquaresEngine {
    fn steps_per_epoch(&self) -> usize {
        self.train_loader.num_batches()
    }

    fn train_one_epoch(
        &mut self,
        model: &ModelHandle,
        optimizer: &mut GroupedAdamW,
        scaler: &mut GradScaler,
        mut ema: Option<&mut Ema>,
        ctx: &TrainContext<'_>,
    ) -> convnext_finetune::Result<BTreeMap<String, f64>> {
        self.train_loader.reset();

        let mut total_loss = 0.0f64;
        let mut step = 0usize;
        while let Some((input, target)) = self.train_loader.next_batch(&self.device)? {
            if let Some(&lr) = ctx.lr_schedule.get(step) {
                optimizer.set_learning_rate(lr);
            }
            if let Some(&wd) = ctx.wd_schedule.get(step) {
                optimizer.set_weight_decay(wd);
            }

            let loss = Self::batch_loss(model, &input, &target)?;
            optimizer.backward_step(&loss)?;
            scaler.update(false);

            if let Some(ema) = ema.as_deref_mut() {
                ema.update(model)?;
            }

            total_loss += loss.to_scalar::<f32>()? as f64;
            step += 1;
        }

        let mut stats = BTreeMap::new();
        stats.insert("loss".to_string(), total_loss / step.max(1) as f64);
        stats.insert(
            "lr".to_string(),
            ctx.lr_schedule.last().copied().unwrap_or(0.0),
        );
        Ok(stats)
    }

    fn evaluate(&mut self, model: &ModelHandle) -> convnext_finetune::Result<Option<EvalMetrics>> {
        self.eval_loader.reset();

        let mut total_loss = 0.0f64;
        let mut batches = 0usize;
        while let Some((input, target)) = self.eval_loader.next_batch(&self.device)? {
            let loss = Self::batch_loss(model, &input, &target)?;
            total_loss += loss.to_scalar::<f32>()? as f64;
            batches += 1;
        }
        if batches == 0 {
            return Ok(None);
        }

        let loss = total_loss / batches as f64;
        Ok(Some(EvalMetrics {
            acc1: 100.0 / (1.0 + loss),
            acc5: 100.0,
            loss,
            extra: BTreeMap::new(),
        }))
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("=== fine-tuning controller - synthetic demo ===");
    let device = Device::Cpu;

    let provider = VectorProvider {
        device: device.clone(),
    };
    let (train_loader, num_classes) = provider.build_dataset(true)?;
    let (eval_loader, _) = provider.build_dataset(false)?;
    log::info!(
        "Synthetic dataset: {} train batches, {} eval batches, {} classes",
        train_loader.num_batches(),
        eval_loader.num_batches(),
        num_classes
    );

    let model = ModelHandle::new("convnext_base", num_classes)?;
    model.varmap().get(
        (num_classes, FEATURES),
        "head.weight",
        Init::Const(0.0),
        DType::F32,
        &device,
    )?;
    model.varmap().get(
        (FEATURES, FEATURES),
        "stages.0.0.dwconv.weight",
        Init::Const(0.0),
        DType::F32,
        &device,
    )?;
    log::info!("Model parameters: {}", model.num_parameters());

    let config = RunConfig {
        dataset: "synthetic".to_string(),
        epochs: 5,
        warmup_epochs: 1,
        lr: 0.1,
        min_lr: 1e-3,
        layer_decay: 0.9,
        model_ema: true,
        model_ema_eval: true,
        output_dir: "demo-output".into(),
        ..Default::default()
    };

    let engine = LeastSquaresEngine {
        train_loader,
        eval_loader,
        device: device.clone(),
    };

    let mut controller = RunController::new(config, engine, model, device)?;
    let summary = controller.run()?;

    log::info!(
        "Done in {:.1}s; best accuracy {:.2}% (EMA {:?})",
        summary.elapsed_secs,
        summary.best.primary,
        summary.best.ema,
    );
    Ok(())
}
