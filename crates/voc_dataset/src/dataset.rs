//! Dataset trait and the VOC adapter producing `(image, label)` samples.

use crate::encode::{LabelEncoder, DEFAULT_IMAGE_SIZE};
use crate::transform::{to_chw, TransformPipeline};
use crate::types::{DataMode, DatasetResult, Sample, VocDatasetError};
use crate::voc::{RawDataset, VocDetection};
use std::ops::{Range, RangeFrom, RangeFull, RangeTo};
use std::path::Path;
use std::sync::Arc;

/// A fixed-size collection of items addressed by index.
pub trait Dataset<I>: Send + Sync {
    /// Gets the item at the given index.
    fn get(&self, index: usize) -> DatasetResult<I>;

    /// Gets the number of items in the dataset.
    fn len(&self) -> usize;

    /// Checks if the dataset is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D, I> Dataset<I> for Arc<D>
where
    D: Dataset<I> + ?Sized,
{
    fn get(&self, index: usize) -> DatasetResult<I> {
        self.as_ref().get(index)
    }

    fn len(&self) -> usize {
        self.as_ref().len()
    }
}

/// Python-style `start:stop:step` selection; unset fields default to `0`, `len` and `1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceSpec {
    pub start: Option<usize>,
    pub stop: Option<usize>,
    pub step: Option<usize>,
}

impl SliceSpec {
    pub fn new(start: Option<usize>, stop: Option<usize>, step: Option<usize>) -> Self {
        Self { start, stop, step }
    }

    pub fn step_by(mut self, step: usize) -> Self {
        self.step = Some(step);
        self
    }

    /// Indices selected against a dataset of length `len`, in iteration order.
    pub fn indices(&self, len: usize) -> DatasetResult<Vec<usize>> {
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(VocDatasetError::InvalidSlice);
        }
        let start = self.start.unwrap_or(0);
        let stop = self.stop.unwrap_or(len);
        Ok((start..stop).step_by(step).collect())
    }
}

impl From<Range<usize>> for SliceSpec {
    fn from(r: Range<usize>) -> Self {
        Self::new(Some(r.start), Some(r.end), None)
    }
}

impl From<RangeFrom<usize>> for SliceSpec {
    fn from(r: RangeFrom<usize>) -> Self {
        Self::new(Some(r.start), None, None)
    }
}

impl From<RangeTo<usize>> for SliceSpec {
    fn from(r: RangeTo<usize>) -> Self {
        Self::new(None, Some(r.end), None)
    }
}

impl From<RangeFull> for SliceSpec {
    fn from(_: RangeFull) -> Self {
        Self::default()
    }
}

/// VOC detection samples, transformed and encoded for one [`DataMode`].
///
/// The raw source, transform pipeline and encoder are fixed at construction, so a
/// shared `Arc<VocDataset>` can be read from many threads.
#[derive(Debug, Clone)]
pub struct VocDataset<R: RawDataset = VocDetection> {
    raw: R,
    mode: DataMode,
    encoder: LabelEncoder,
    transforms: Option<TransformPipeline>,
    len: usize,
}

impl VocDataset<VocDetection> {
    /// Open `image_set` under `folder`. `mode` must be `"yolo"` or `"bbox"`; it is
    /// checked before the filesystem is touched.
    ///
    /// In `yolo` mode the transform's target size, if any, must be square: it sets the
    /// grid of every output scale.
    pub fn new(
        folder: impl AsRef<Path>,
        mode: &str,
        image_set: &str,
        transforms: Option<TransformPipeline>,
    ) -> DatasetResult<Self> {
        let mode: DataMode = mode.parse()?;
        let encoder = default_encoder(mode, transforms.as_ref())?;
        let raw = VocDetection::new(folder, image_set)?;
        Ok(Self::from_source(raw, mode, encoder, transforms))
    }
}

impl<R: RawDataset> VocDataset<R> {
    pub fn from_source(
        raw: R,
        mode: DataMode,
        encoder: LabelEncoder,
        transforms: Option<TransformPipeline>,
    ) -> Self {
        let len = raw.len();
        if let Some(t) = &transforms {
            log::info!("voc dataset: {len} samples, mode={mode}, {}", t.describe());
        } else {
            log::info!("voc dataset: {len} samples, mode={mode}, no transforms");
        }
        Self {
            raw,
            mode,
            encoder,
            transforms,
            len,
        }
    }

    pub fn with_encoder(mut self, encoder: LabelEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn mode(&self) -> DataMode {
        self.mode
    }

    pub fn encoder(&self) -> &LabelEncoder {
        &self.encoder
    }

    pub fn transforms(&self) -> Option<&TransformPipeline> {
        self.transforms.as_ref()
    }

    pub fn raw(&self) -> &R {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Load, transform and encode one sample. Bounds are checked by the raw source.
    pub fn get(&self, index: usize) -> DatasetResult<Sample> {
        let raw = self.raw.get(index)?;
        let (width, height) = raw.image.dimensions();
        let boxes = raw
            .annotation
            .to_box_labels(width, height, &raw.annotation_path)?;
        let (image, boxes) = match &self.transforms {
            Some(pipeline) => pipeline.apply(raw.image, boxes, index as u64)?,
            None => (to_chw(&raw.image, None), boxes),
        };
        let label = self.encoder.encode(self.mode, &boxes)?;
        Ok(Sample { image, label })
    }

    /// Eagerly load every sample selected by `slice`, in slice order.
    pub fn get_slice(&self, slice: impl Into<SliceSpec>) -> DatasetResult<Vec<Sample>> {
        slice
            .into()
            .indices(self.len)?
            .into_iter()
            .map(|i| self.get(i))
            .collect()
    }
}

impl<R: RawDataset> Dataset<Sample> for VocDataset<R> {
    fn get(&self, index: usize) -> DatasetResult<Sample> {
        VocDataset::get(self, index)
    }

    fn len(&self) -> usize {
        self.len
    }
}

fn default_encoder(
    mode: DataMode,
    transforms: Option<&TransformPipeline>,
) -> DatasetResult<LabelEncoder> {
    let size = match (mode, transforms.and_then(|t| t.target_size)) {
        (DataMode::Yolo, Some((w, h))) if w != h => {
            return Err(VocDatasetError::Other(format!(
                "yolo mode needs a square target size, got {w}x{h}"
            )))
        }
        (DataMode::Yolo, Some((w, _))) => w,
        _ => DEFAULT_IMAGE_SIZE,
    };
    LabelEncoder::for_image_size(size)
}
