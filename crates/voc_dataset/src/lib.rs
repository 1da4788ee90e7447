//! Pascal VOC dataset loading, YOLO label encoding, splitting, and batch loading.
//!
//! This crate provides utilities for:
//! - Reading VOC-layout detection datasets from the filesystem
//! - Resizing/normalizing images while keeping boxes aligned
//! - Encoding boxes as raw labels or multi-scale YOLOv3 anchor targets
//! - Random train/val splitting with an injectable RNG
//! - Shuffling batch loaders and Burn tensor collation

// Module declarations
pub mod dataset;
pub mod encode;
pub mod loader;
pub mod split;
pub mod transform;
pub mod types;
pub mod voc;

#[cfg(feature = "burn-runtime")]
pub mod batch;

// Re-export public API
pub use dataset::{Dataset, SliceSpec, VocDataset};
pub use encode::{AnchorSet, LabelEncoder, DEFAULT_IMAGE_SIZE, DEFAULT_STRIDES};
pub use loader::{
    load_datasets, load_datasets_with, BatchLoader, DataLoader, LoaderConfig, VocLoader, VocSubset,
};
pub use split::{random_split, split_lengths, SubsetDataset};
pub use transform::{Normalization, TransformPipeline, TransformPipelineBuilder};
pub use types::*;
pub use voc::{Annotation, RawDataset, RawSample, VocDetection, VOC_CLASSES};

#[cfg(feature = "burn-runtime")]
pub use batch::{collate_yolo, YoloBatch};
