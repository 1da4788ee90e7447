//! Training configuration: TOML file, then `YOLO_VOC_*` environment overrides.

use crate::loss::LossWeights;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use voc_dataset::{AnchorSet, LoaderConfig, DEFAULT_IMAGE_SIZE, DEFAULT_STRIDES, VOC_CLASSES};

pub const DEFAULT_CONFIG_NAME: &str = "yolo-voc.toml";
pub const CONFIG_PATH_ENV: &str = "YOLO_VOC_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainConfig {
    pub data_folder: PathBuf,
    pub image_set: String,
    pub image_size: u32,
    pub batch_size: usize,
    pub epochs: usize,
    pub training_ratio: f64,
    pub learning_rate: f64,
    pub seed: Option<u64>,
    pub anchors: AnchorSet,
    pub num_classes: usize,
    /// Stem channels of the model.
    pub model_width: usize,
    pub loss_weights: LossWeights,
    pub checkpoint: PathBuf,
    /// JSONL file receiving one record per epoch.
    pub metrics_path: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_folder: PathBuf::from("data/voc"),
            image_set: "trainval".to_string(),
            image_size: DEFAULT_IMAGE_SIZE,
            batch_size: 16,
            epochs: 100,
            training_ratio: 0.8,
            learning_rate: 1e-4,
            seed: None,
            anchors: AnchorSet::default(),
            num_classes: VOC_CLASSES.len(),
            model_width: 16,
            loss_weights: LossWeights::default(),
            checkpoint: PathBuf::from("checkpoints/yolo_v3_tiny.bin"),
            metrics_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TrainConfigFile {
    data_folder: Option<String>,
    image_set: Option<String>,
    image_size: Option<u32>,
    batch_size: Option<usize>,
    epochs: Option<usize>,
    training_ratio: Option<f64>,
    learning_rate: Option<f64>,
    seed: Option<u64>,
    anchors: Option<AnchorSet>,
    num_classes: Option<usize>,
    model_width: Option<usize>,
    checkpoint: Option<String>,
    metrics_path: Option<String>,
    loss: Option<LossSection>,
}

#[derive(Debug, Deserialize, Default)]
struct LossSection {
    #[serde(rename = "box")]
    box_weight: Option<f32>,
    obj: Option<f32>,
    noobj: Option<f32>,
    class: Option<f32>,
}

impl TrainConfig {
    /// Read `$YOLO_VOC_CONFIG` (which must exist) or `./yolo-voc.toml` (optional), then
    /// apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::load_from(Some(Path::new(&path))),
            None => Self::load_from(None),
        }
    }

    /// Like [`TrainConfig::load`] with an explicit file in place of the lookup.
    pub fn load_from(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(path) => Self::from_path(path)?,
            None if Path::new(DEFAULT_CONFIG_NAME).exists() => {
                Self::from_path(Path::new(DEFAULT_CONFIG_NAME))?
            }
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let file: TrainConfigFile = toml::from_str(raw)?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: TrainConfigFile) -> Self {
        let defaults = Self::default();
        let loss = file.loss.unwrap_or_default();
        let weights = defaults.loss_weights;
        TrainConfig {
            data_folder: file
                .data_folder
                .map(|v| expand_path(&v))
                .unwrap_or(defaults.data_folder),
            image_set: file
                .image_set
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.image_set),
            image_size: file.image_size.unwrap_or(defaults.image_size),
            batch_size: file.batch_size.unwrap_or(defaults.batch_size),
            epochs: file.epochs.unwrap_or(defaults.epochs),
            training_ratio: file.training_ratio.unwrap_or(defaults.training_ratio),
            learning_rate: file.learning_rate.unwrap_or(defaults.learning_rate),
            seed: file.seed,
            anchors: file.anchors.unwrap_or(defaults.anchors),
            num_classes: file.num_classes.unwrap_or(defaults.num_classes),
            model_width: file.model_width.unwrap_or(defaults.model_width),
            loss_weights: LossWeights {
                box_weight: loss.box_weight.unwrap_or(weights.box_weight),
                obj: loss.obj.unwrap_or(weights.obj),
                noobj: loss.noobj.unwrap_or(weights.noobj),
                class: loss.class.unwrap_or(weights.class),
            },
            checkpoint: file
                .checkpoint
                .map(|v| expand_path(&v))
                .unwrap_or(defaults.checkpoint),
            metrics_path: file.metrics_path.map(|v| expand_path(&v)),
        }
    }

    /// Apply `YOLO_VOC_DATA_FOLDER`, `YOLO_VOC_IMAGE_SIZE`, `YOLO_VOC_BATCH_SIZE` and
    /// `YOLO_VOC_EPOCHS` as returned by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = lookup("YOLO_VOC_DATA_FOLDER") {
            self.data_folder = expand_path(&v);
        }
        if let Some(v) = lookup("YOLO_VOC_IMAGE_SIZE") {
            self.image_size = parse_env("YOLO_VOC_IMAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("YOLO_VOC_BATCH_SIZE") {
            self.batch_size = parse_env("YOLO_VOC_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("YOLO_VOC_EPOCHS") {
            self.epochs = parse_env("YOLO_VOC_EPOCHS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        if !(self.training_ratio > 0.0 && self.training_ratio < 1.0) {
            anyhow::bail!(
                "training_ratio must lie strictly between 0 and 1, got {}",
                self.training_ratio
            );
        }
        if let Some(stride) = DEFAULT_STRIDES
            .iter()
            .find(|s| self.image_size == 0 || self.image_size % **s != 0)
        {
            anyhow::bail!(
                "image_size {} must be a positive multiple of {stride}",
                self.image_size
            );
        }
        if self.anchors.num_scales() != DEFAULT_STRIDES.len() {
            anyhow::bail!(
                "expected {} anchor scales, got {}",
                DEFAULT_STRIDES.len(),
                self.anchors.num_scales()
            );
        }
        if self.num_classes == 0 {
            anyhow::bail!("num_classes must be at least 1");
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            anyhow::bail!("learning_rate must be positive");
        }
        Ok(())
    }

    pub fn loader_config(&self) -> LoaderConfig {
        let mut cfg = LoaderConfig::new(&self.data_folder, self.image_size, self.batch_size);
        cfg.training_ratio = self.training_ratio;
        cfg.image_set = self.image_set.clone();
        cfg.anchors = self.anchors.clone();
        cfg.num_classes = self.num_classes;
        cfg.seed = self.seed;
        cfg
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{key}={raw:?} is not valid: {e}"))
}

fn expand_path(raw: &str) -> PathBuf {
    if let Some(stripped) = raw.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(raw)
}
