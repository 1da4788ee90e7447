//! Core types, error definitions, and data structures for voc_dataset.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, VocDatasetError>;

#[derive(Debug, Error)]
pub enum VocDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("annotation parse error at {path}: {source}")]
    Xml {
        path: PathBuf,
        #[source]
        source: quick_xml::DeError,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("annotation validation failed at {path}: {msg}")]
    Validation { path: PathBuf, msg: String },
    #[error("`{value}` is not a valid data mode, expected `yolo` or `bbox`")]
    InvalidMode { value: String },
    #[error("index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("slice step cannot be zero")]
    InvalidSlice,
    #[error("training ratio {ratio} must lie strictly between 0 and 1")]
    InvalidRatio { ratio: f64 },
    #[error("batch size must be positive")]
    InvalidBatchSize,
    #[error("{0}")]
    Other(String),
}

/// Label representation returned by the dataset adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataMode {
    /// Multi-scale anchor targets for YOLO training.
    Yolo,
    /// Normalized boxes passed through unchanged.
    Bbox,
}

impl DataMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataMode::Yolo => "yolo",
            DataMode::Bbox => "bbox",
        }
    }
}

impl FromStr for DataMode {
    type Err = VocDatasetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "yolo" => Ok(DataMode::Yolo),
            "bbox" => Ok(DataMode::Bbox),
            other => Err(VocDatasetError::InvalidMode {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for DataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    /// Stretch to fill the target dimensions (boxes keep their normalized coordinates).
    Force,
    /// Preserve aspect ratio; pad to target with zeros.
    Letterbox,
}

/// A single object box with normalized `[x_min, y_min, x_max, y_max]` coordinates in 0..1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxLabel {
    pub class_id: usize,
    pub bbox: [f32; 4],
}

impl BoxLabel {
    /// Center/size form `[cx, cy, w, h]`, still normalized.
    pub fn center_size(&self) -> [f32; 4] {
        let [x0, y0, x1, y1] = self.bbox;
        [(x0 + x1) * 0.5, (y0 + y1) * 0.5, x1 - x0, y1 - y0]
    }
}

/// Image in CHW layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

impl ImageTensor {
    pub const CHANNELS: usize = 3;

    pub fn shape(&self) -> [usize; 3] {
        [Self::CHANNELS, self.height as usize, self.width as usize]
    }
}

/// Values stored per anchor/cell: objectness, x, y, w, h, class.
pub const TARGET_FIELDS: usize = 6;

/// YOLO targets for one detection scale, laid out `[anchor][row][col][field]`.
///
/// Objectness is `1.0` for an assigned anchor, `0.0` for background and `-1.0`
/// for anchors that overlap a box well enough to be excluded from the no-object loss.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleTarget {
    pub grid: usize,
    pub anchors: usize,
    pub data: Vec<f32>,
}

impl ScaleTarget {
    pub fn zeros(grid: usize, anchors: usize) -> Self {
        Self {
            grid,
            anchors,
            data: vec![0.0; anchors * grid * grid * TARGET_FIELDS],
        }
    }

    fn offset(&self, anchor: usize, row: usize, col: usize) -> usize {
        ((anchor * self.grid + row) * self.grid + col) * TARGET_FIELDS
    }

    pub fn cell(&self, anchor: usize, row: usize, col: usize) -> &[f32] {
        let base = self.offset(anchor, row, col);
        &self.data[base..base + TARGET_FIELDS]
    }

    pub fn cell_mut(&mut self, anchor: usize, row: usize, col: usize) -> &mut [f32] {
        let base = self.offset(anchor, row, col);
        &mut self.data[base..base + TARGET_FIELDS]
    }

    pub fn shape(&self) -> [usize; 4] {
        [self.anchors, self.grid, self.grid, TARGET_FIELDS]
    }

    /// Number of anchors with objectness 1.
    pub fn assigned(&self) -> usize {
        self.data
            .chunks_exact(TARGET_FIELDS)
            .filter(|c| c[0] == 1.0)
            .count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct YoloTarget {
    /// One target per scale, coarse grid first.
    pub scales: Vec<ScaleTarget>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Label {
    Yolo(YoloTarget),
    Bbox(Vec<BoxLabel>),
}

impl Label {
    pub fn mode(&self) -> DataMode {
        match self {
            Label::Yolo(_) => DataMode::Yolo,
            Label::Bbox(_) => DataMode::Bbox,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub image: ImageTensor,
    pub label: Label,
}
