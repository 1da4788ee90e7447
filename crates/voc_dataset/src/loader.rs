//! Shuffling batch loaders and the train/val loader factory.

use crate::dataset::{Dataset, VocDataset};
use crate::encode::{AnchorSet, LabelEncoder, DEFAULT_STRIDES};
use crate::split::{random_split, split_lengths, SubsetDataset};
use crate::transform::TransformPipeline;
use crate::types::{DataMode, DatasetResult, Sample, VocDatasetError};
use crate::voc::VOC_CLASSES;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub(crate) const DEFAULT_LOG_EVERY_SAMPLES: usize = 1000;

/// Produces batches over a dataset; every call to [`BatchLoader::iter`] starts a new pass.
pub trait BatchLoader<I>: Send + Sync {
    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = DatasetResult<Vec<I>>> + 'a>;

    fn num_items(&self) -> usize;

    fn batch_size(&self) -> usize;

    /// Batches per pass; the last one may be partial.
    fn num_batches(&self) -> usize {
        self.num_items().div_ceil(self.batch_size())
    }
}

pub struct DataLoader<D, I> {
    dataset: Arc<D>,
    batch_size: usize,
    shuffle: bool,
    rng: Mutex<StdRng>,
    log_every_samples: Option<usize>,
    input: PhantomData<fn() -> I>,
}

impl<D, I> DataLoader<D, I>
where
    D: Dataset<I>,
    I: Send,
{
    pub fn new(dataset: Arc<D>, batch_size: usize, shuffle: bool, rng: StdRng) -> DatasetResult<Self> {
        if batch_size == 0 {
            return Err(VocDatasetError::InvalidBatchSize);
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            rng: Mutex::new(rng),
            log_every_samples: log_every_from_env(),
            input: PhantomData,
        })
    }

    pub fn dataset(&self) -> &Arc<D> {
        &self.dataset
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn with_log_every(mut self, samples: Option<usize>) -> Self {
        self.log_every_samples = samples;
        self
    }

    fn next_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            order.shuffle(&mut *rng);
        }
        order
    }
}

impl<D, I> BatchLoader<I> for DataLoader<D, I>
where
    D: Dataset<I>,
    I: Send,
{
    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = DatasetResult<Vec<I>>> + 'a> {
        let now = Instant::now();
        Box::new(BatchIter {
            dataset: self.dataset.as_ref(),
            order: self.next_order(),
            cursor: 0,
            batch_size: self.batch_size,
            processed_samples: 0,
            processed_batches: 0,
            started: now,
            total_load_time: Duration::ZERO,
            last_log: now,
            last_logged_samples: 0,
            log_every_samples: self.log_every_samples,
            input: PhantomData,
        })
    }

    fn num_items(&self) -> usize {
        self.dataset.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

struct BatchIter<'a, D, I> {
    dataset: &'a D,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    processed_samples: usize,
    processed_batches: usize,
    started: Instant,
    total_load_time: Duration,
    last_log: Instant,
    last_logged_samples: usize,
    log_every_samples: Option<usize>,
    input: PhantomData<fn() -> I>,
}

impl<D, I> Iterator for BatchIter<'_, D, I>
where
    D: Dataset<I>,
    I: Send,
{
    type Item = DatasetResult<Vec<I>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let slice = &self.order[self.cursor..end];

        let t_load = Instant::now();
        let dataset = self.dataset;
        let loaded: DatasetResult<Vec<I>> = slice.par_iter().map(|&i| dataset.get(i)).collect();
        let load_elapsed = t_load.elapsed();

        match loaded {
            Ok(batch) => {
                self.cursor = end;
                self.processed_samples += batch.len();
                self.processed_batches += 1;
                self.total_load_time += load_elapsed;
                self.maybe_log_progress();
                Some(Ok(batch))
            }
            Err(e) => {
                // A failed sample ends the pass.
                self.cursor = self.order.len();
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.cursor).div_ceil(self.batch_size);
        (0, Some(remaining))
    }
}

impl<D, I> BatchIter<'_, D, I> {
    fn maybe_log_progress(&mut self) {
        let Some(threshold) = self.log_every_samples else {
            return;
        };
        let processed_since = self
            .processed_samples
            .saturating_sub(self.last_logged_samples);
        let should_log =
            processed_since >= threshold || self.last_log.elapsed() >= Duration::from_secs(30);
        if !should_log {
            return;
        }
        let secs = self.started.elapsed().as_secs_f32().max(0.001);
        let avg_load_ms = if self.processed_batches > 0 {
            (self.total_load_time.as_secs_f64() * 1000.0) / self.processed_batches as f64
        } else {
            0.0
        };
        log::info!(
            "[dataset] batches={} samples={}/{} elapsed={:.1}s rate={:.1} img/s avg_load_ms={:.2}",
            self.processed_batches,
            self.processed_samples,
            self.order.len(),
            secs,
            self.processed_samples as f32 / secs,
            avg_load_ms
        );
        self.last_logged_samples = self.processed_samples;
        self.last_log = Instant::now();
    }
}

fn log_every_from_env() -> Option<usize> {
    match std::env::var("VOC_DATASET_LOG_EVERY") {
        Ok(val) => {
            if val.eq_ignore_ascii_case("off") || val.trim() == "0" {
                None
            } else {
                val.trim().parse::<usize>().ok().filter(|v| *v > 0)
            }
        }
        Err(_) => Some(DEFAULT_LOG_EVERY_SAMPLES),
    }
}

pub type VocSubset = SubsetDataset<VocDataset, Sample>;
pub type VocLoader = DataLoader<VocSubset, Sample>;

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub data_folder: PathBuf,
    /// Square input size; must be divisible by every stride.
    pub dimension: u32,
    pub batch_size: usize,
    pub training_ratio: f64,
    pub image_set: String,
    pub anchors: AnchorSet,
    pub num_classes: usize,
    /// Seed for the split and per-pass shuffles; `None` draws from the thread RNG.
    pub seed: Option<u64>,
}

impl LoaderConfig {
    pub fn new(data_folder: impl Into<PathBuf>, dimension: u32, batch_size: usize) -> Self {
        Self {
            data_folder: data_folder.into(),
            dimension,
            batch_size,
            training_ratio: 0.8,
            image_set: "trainval".to_string(),
            anchors: AnchorSet::default(),
            num_classes: VOC_CLASSES.len(),
            seed: None,
        }
    }
}

/// Training and validation loaders over the `trainval` set, YOLO-encoded at `dimension`.
pub fn load_datasets(
    data_folder: impl AsRef<Path>,
    dimension: u32,
    batch_size: usize,
    training_ratio: f64,
) -> DatasetResult<(VocLoader, VocLoader)> {
    let mut cfg = LoaderConfig::new(data_folder.as_ref(), dimension, batch_size);
    cfg.training_ratio = training_ratio;
    load_datasets_with(&cfg)
}

pub fn load_datasets_with(cfg: &LoaderConfig) -> DatasetResult<(VocLoader, VocLoader)> {
    if cfg.batch_size == 0 {
        return Err(VocDatasetError::InvalidBatchSize);
    }
    split_lengths(0, cfg.training_ratio)?;

    let normalization = TransformPipeline::normalization(cfg.dimension);
    let encoder = LabelEncoder::new(cfg.dimension, cfg.anchors.clone(), DEFAULT_STRIDES.to_vec())?
        .with_num_classes(cfg.num_classes);
    let data = VocDataset::new(
        &cfg.data_folder,
        DataMode::Yolo.as_str(),
        &cfg.image_set,
        Some(normalization),
    )?
    .with_encoder(encoder);

    let (training_length, validation_length) = split_lengths(data.len(), cfg.training_ratio)?;
    let mut rng = match cfg.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    };
    let (train_idx, val_idx) = random_split(data.len(), training_length, &mut rng);
    log::info!(
        "split {} samples from {}: training={} validation={} batch_size={}",
        data.len(),
        cfg.data_folder.display(),
        training_length,
        validation_length,
        cfg.batch_size
    );

    let data = Arc::new(data);
    let training = SubsetDataset::new(Arc::clone(&data), train_idx);
    let validation = SubsetDataset::new(data, val_idx);

    let training = DataLoader::new(
        Arc::new(training),
        cfg.batch_size,
        true,
        StdRng::from_rng(&mut rng),
    )?;
    let validation = DataLoader::new(
        Arc::new(validation),
        cfg.batch_size,
        true,
        StdRng::from_rng(&mut rng),
    )?;
    Ok((training, validation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    struct Numbers(usize);

    impl Dataset<usize> for Numbers {
        fn get(&self, index: usize) -> DatasetResult<usize> {
            if index < self.0 {
                Ok(index)
            } else {
                Err(VocDatasetError::IndexOutOfRange { index, len: self.0 })
            }
        }

        fn len(&self) -> usize {
            self.0
        }
    }

    /// Fails on one poisoned index.
    struct Poisoned(usize, usize);

    impl Dataset<usize> for Poisoned {
        fn get(&self, index: usize) -> DatasetResult<usize> {
            if index == self.1 {
                Err(VocDatasetError::Other(format!("bad sample {index}")))
            } else {
                Ok(index)
            }
        }

        fn len(&self) -> usize {
            self.0
        }
    }

    fn loader(len: usize, batch: usize, shuffle: bool) -> DataLoader<Numbers, usize> {
        DataLoader::new(
            Arc::new(Numbers(len)),
            batch,
            shuffle,
            StdRng::seed_from_u64(11),
        )
        .unwrap()
        .with_log_every(None)
    }

    fn batch_sizes<L: BatchLoader<usize>>(l: &L) -> Vec<usize> {
        l.iter().map(|b| b.unwrap().len()).collect()
    }

    #[test]
    fn split_of_hundred_yields_full_batches() {
        let (train_len, val_len) = split_lengths(100, 0.8).unwrap();
        let (train, val) = random_split(100, train_len, &mut StdRng::seed_from_u64(1));
        let data = Arc::new(Numbers(100));
        let train: DataLoader<_, usize> = DataLoader::new(
            Arc::new(SubsetDataset::new(Arc::clone(&data), train)),
            10,
            true,
            StdRng::seed_from_u64(2),
        )
        .unwrap();
        let val: DataLoader<_, usize> = DataLoader::new(
            Arc::new(SubsetDataset::new(data, val)),
            10,
            true,
            StdRng::seed_from_u64(3),
        )
        .unwrap();
        assert_eq!(val_len, 20);
        assert_eq!(train.num_batches(), 8);
        assert_eq!(batch_sizes(&train), vec![10; 8]);
        assert_eq!(val.num_batches(), 2);
        assert_eq!(batch_sizes(&val), vec![10; 2]);
    }

    #[test]
    fn uneven_lengths_end_with_partial_batch() {
        let (train_len, val_len) = split_lengths(105, 0.8).unwrap();
        assert_eq!((train_len, val_len), (84, 21));
        let train = loader(train_len, 10, true);
        let sizes = batch_sizes(&train);
        assert_eq!(sizes.len(), 9);
        assert_eq!(sizes.last(), Some(&4));
        let val = loader(val_len, 10, true);
        assert_eq!(batch_sizes(&val), vec![10, 10, 1]);
    }

    #[test]
    fn each_pass_visits_every_item_once() {
        let l = loader(37, 8, true);
        for _ in 0..3 {
            let seen: Vec<usize> = l.iter().flat_map(|b| b.unwrap()).collect();
            assert_eq!(seen.len(), 37);
            assert_eq!(seen.into_iter().collect::<BTreeSet<_>>().len(), 37);
        }
    }

    #[test]
    fn shuffle_reorders_between_passes() {
        let l = loader(64, 64, true);
        let first: Vec<usize> = l.iter().flat_map(|b| b.unwrap()).collect();
        let second: Vec<usize> = l.iter().flat_map(|b| b.unwrap()).collect();
        assert_ne!(first, second);
    }

    #[test]
    fn unshuffled_loader_keeps_order() {
        let l = loader(5, 2, false);
        let batches: Vec<Vec<usize>> = l.iter().map(|b| b.unwrap()).collect();
        assert_eq!(batches, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn failing_sample_ends_the_pass() {
        let l: DataLoader<_, usize> =
            DataLoader::new(Arc::new(Poisoned(6, 3)), 2, false, StdRng::seed_from_u64(0))
                .unwrap()
                .with_log_every(None);
        let results: Vec<_> = l.iter().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(matches!(
            DataLoader::<_, usize>::new(Arc::new(Numbers(3)), 0, true, StdRng::seed_from_u64(0)),
            Err(VocDatasetError::InvalidBatchSize)
        ));
    }

    #[test]
    fn factory_validates_before_touching_disk() {
        let mut cfg = LoaderConfig::new("/definitely/not/here", 32, 4);
        cfg.training_ratio = 1.0;
        assert!(matches!(
            load_datasets_with(&cfg),
            Err(VocDatasetError::InvalidRatio { .. })
        ));
        cfg.training_ratio = 0.8;
        cfg.batch_size = 0;
        assert!(matches!(
            load_datasets_with(&cfg),
            Err(VocDatasetError::InvalidBatchSize)
        ));
        cfg.batch_size = 4;
        cfg.dimension = 0;
        assert!(matches!(
            load_datasets_with(&cfg),
            Err(VocDatasetError::Other(msg)) if msg.contains("positive")
        ));
    }
}
