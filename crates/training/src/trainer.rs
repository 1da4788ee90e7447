use crate::config::TrainConfig;
use crate::loss::{yolo_loss, LossValues};
use crate::TrainBackend;
use anyhow::Context;
use burn::backend::Autodiff;
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use models::{YoloV3Tiny, YoloV3TinyConfig};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use voc_dataset::{collate_yolo, load_datasets_with, BatchLoader, VocLoader};

pub type ADBackend = Autodiff<TrainBackend>;
type Device = <TrainBackend as Backend>::Device;

/// One JSON line of the metrics file.
#[derive(Debug, Clone, Serialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train: LossValues,
    pub val: Option<LossValues>,
    pub train_batches: usize,
    pub val_batches: usize,
    pub seconds: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub epochs: Vec<EpochMetrics>,
    pub checkpoint: PathBuf,
    pub num_params: usize,
}

impl TrainReport {
    pub fn final_train_loss(&self) -> Option<f32> {
        self.epochs.last().map(|e| e.train.total)
    }
}

pub struct YoloTrainer {
    config: TrainConfig,
    device: Device,
    model: YoloV3Tiny<ADBackend>,
}

impl YoloTrainer {
    pub fn new(config: TrainConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let device = Device::default();
        let model = YoloV3Tiny::new(model_config(&config), &device);
        Ok(Self {
            config,
            device,
            model,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn model(&self) -> &YoloV3Tiny<ADBackend> {
        &self.model
    }

    /// Log the model topology and parameter count.
    pub fn plot_model(self) -> Self {
        log::info!("model:\n{}", self.model.summary());
        log::info!("trainable parameters: {}", self.model.num_params());
        self
    }

    /// Run `epochs` passes over the training split, evaluating on the validation split
    /// after each, then save the final weights to the configured checkpoint.
    pub fn train(&self) -> anyhow::Result<TrainReport> {
        let (training, validation) = load_datasets_with(&self.config.loader_config())
            .with_context(|| {
                format!("failed to load VOC data from {}", self.config.data_folder.display())
            })?;
        if training.num_items() == 0 {
            anyhow::bail!(
                "no training samples under {} (image set `{}`)",
                self.config.data_folder.display(),
                self.config.image_set
            );
        }
        if validation.num_items() == 0 {
            log::warn!("validation split is empty; epochs will report training loss only");
        }
        if let Some(parent) = self.config.checkpoint.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut model = self.model.clone();
        let mut optim = AdamConfig::new().init();
        let weights = self.config.loss_weights;
        let mut history = Vec::with_capacity(self.config.epochs);

        for epoch in 0..self.config.epochs {
            let start = Instant::now();
            let mut total = LossValues::default();
            let mut train_batches = 0usize;
            for batch in training.iter() {
                let samples = batch?;
                let batch = collate_yolo::<ADBackend>(&samples, &self.device)?;
                let preds = model.forward(batch.images);
                let parts = yolo_loss(&preds, &batch.targets, &self.config.anchors)?;
                total += parts.values(&weights)?;
                let loss = parts.total(&weights);
                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(self.config.learning_rate, model, grads);
                train_batches += 1;
            }
            let train = average(total, train_batches);

            let (val, val_batches) = self.evaluate(&model.valid(), &validation)?;
            let metrics = EpochMetrics {
                epoch,
                train,
                val,
                train_batches,
                val_batches,
                seconds: start.elapsed().as_secs_f32(),
            };
            match val {
                Some(val) => log::info!(
                    "epoch {}/{}: train loss {:.4} val loss {:.4} ({:.1}s)",
                    epoch + 1,
                    self.config.epochs,
                    train.total,
                    val.total,
                    metrics.seconds
                ),
                None => log::info!(
                    "epoch {}/{}: train loss {:.4} ({:.1}s)",
                    epoch + 1,
                    self.config.epochs,
                    train.total,
                    metrics.seconds
                ),
            }
            if let Some(path) = &self.config.metrics_path {
                append_metrics(path, &metrics)?;
            }
            history.push(metrics);
        }

        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        model
            .clone()
            .save_file(self.config.checkpoint.clone(), &recorder)
            .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))?;
        log::info!("saved checkpoint to {}", self.config.checkpoint.display());

        Ok(TrainReport {
            epochs: history,
            checkpoint: self.config.checkpoint.clone(),
            num_params: model.num_params(),
        })
    }

    fn evaluate(
        &self,
        model: &YoloV3Tiny<TrainBackend>,
        loader: &VocLoader,
    ) -> anyhow::Result<(Option<LossValues>, usize)> {
        let weights = self.config.loss_weights;
        let mut total = LossValues::default();
        let mut batches = 0usize;
        for batch in loader.iter() {
            let samples = batch?;
            let batch = collate_yolo::<TrainBackend>(&samples, &self.device)?;
            let preds = model.forward(batch.images);
            total += yolo_loss(&preds, &batch.targets, &self.config.anchors)?.values(&weights)?;
            batches += 1;
        }
        Ok(((batches > 0).then(|| average(total, batches)), batches))
    }
}

fn model_config(config: &TrainConfig) -> YoloV3TinyConfig {
    YoloV3TinyConfig {
        num_classes: config.num_classes,
        anchors_per_scale: config.anchors.anchors_per_scale(),
        width: config.model_width,
    }
}

fn average(total: LossValues, batches: usize) -> LossValues {
    if batches == 0 {
        total
    } else {
        total.scaled(1.0 / batches as f32)
    }
}

fn append_metrics(path: &Path, metrics: &EpochMetrics) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open metrics file {}", path.display()))?;
    writeln!(file, "{}", serde_json::to_string(metrics)?)?;
    Ok(())
}

/// Rebuild the model described by `config` and load weights saved by [`YoloTrainer::train`].
pub fn load_checkpoint<P: AsRef<Path>>(
    path: P,
    config: &TrainConfig,
    device: &Device,
) -> anyhow::Result<YoloV3Tiny<TrainBackend>> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    YoloV3Tiny::<TrainBackend>::new(model_config(config), device)
        .load_file(path.as_ref().to_path_buf(), &recorder, device)
        .map_err(|e| anyhow::anyhow!("failed to load checkpoint {}: {e}", path.as_ref().display()))
}
