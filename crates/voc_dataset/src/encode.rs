//! Label encoding: raw box passthrough or multi-scale YOLOv3 anchor targets.

use crate::types::{
    BoxLabel, DataMode, DatasetResult, Label, ScaleTarget, VocDatasetError, YoloTarget,
};
use crate::voc::VOC_CLASSES;
use serde::{Deserialize, Serialize};

/// Output strides of the three YOLOv3 heads, coarse first.
pub const DEFAULT_STRIDES: [u32; 3] = [32, 16, 8];

/// Anchors above this shape IoU that lose the assignment are ignored instead of
/// counted as background.
pub const DEFAULT_IGNORE_IOU: f32 = 0.5;

/// Square input size used when no transform fixes one.
pub const DEFAULT_IMAGE_SIZE: u32 = 416;

/// Anchor shapes per scale as normalized `(w, h)`, ordered like [`DEFAULT_STRIDES`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchorSet(pub Vec<Vec<[f32; 2]>>);

impl Default for AnchorSet {
    /// The standard YOLOv3 anchors divided by 416.
    fn default() -> Self {
        AnchorSet(vec![
            vec![[0.28, 0.22], [0.38, 0.48], [0.9, 0.78]],
            vec![[0.07, 0.15], [0.15, 0.11], [0.14, 0.29]],
            vec![[0.02, 0.03], [0.04, 0.07], [0.08, 0.06]],
        ])
    }
}

impl AnchorSet {
    pub fn num_scales(&self) -> usize {
        self.0.len()
    }

    pub fn per_scale(&self, scale: usize) -> &[[f32; 2]] {
        &self.0[scale]
    }

    /// Anchors per scale, assuming every scale has the same count.
    pub fn anchors_per_scale(&self) -> usize {
        self.0.first().map(Vec::len).unwrap_or(0)
    }

    fn validate(&self) -> DatasetResult<()> {
        let per = self.anchors_per_scale();
        if per == 0 || self.0.iter().any(|s| s.len() != per) {
            return Err(VocDatasetError::Other(
                "anchor set must have the same non-zero anchor count on every scale".into(),
            ));
        }
        if self.0.iter().flatten().any(|a| !(a[0] > 0.0 && a[1] > 0.0)) {
            return Err(VocDatasetError::Other("anchor sizes must be positive".into()));
        }
        Ok(())
    }
}

/// IoU of two boxes sharing a center, compared by width/height only.
pub fn wh_iou(a: [f32; 2], b: [f32; 2]) -> f32 {
    let inter = a[0].min(b[0]) * a[1].min(b[1]);
    let union = a[0] * a[1] + b[0] * b[1] - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelEncoder {
    pub image_size: u32,
    pub anchors: AnchorSet,
    pub strides: Vec<u32>,
    pub num_classes: usize,
    pub ignore_iou_thresh: f32,
}

impl LabelEncoder {
    pub fn new(image_size: u32, anchors: AnchorSet, strides: Vec<u32>) -> DatasetResult<Self> {
        anchors.validate()?;
        if strides.len() != anchors.num_scales() {
            return Err(VocDatasetError::Other(format!(
                "{} strides given for {} anchor scales",
                strides.len(),
                anchors.num_scales()
            )));
        }
        if image_size == 0 {
            return Err(VocDatasetError::Other("image size must be positive".into()));
        }
        if let Some(s) = strides.iter().find(|s| **s == 0 || image_size % **s != 0) {
            return Err(VocDatasetError::Other(format!(
                "image size {image_size} is not divisible by stride {s}"
            )));
        }
        Ok(Self {
            image_size,
            anchors,
            strides,
            num_classes: VOC_CLASSES.len(),
            ignore_iou_thresh: DEFAULT_IGNORE_IOU,
        })
    }

    /// Default anchors and strides for a square input of `dimension` pixels.
    pub fn for_image_size(dimension: u32) -> DatasetResult<Self> {
        Self::new(dimension, AnchorSet::default(), DEFAULT_STRIDES.to_vec())
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    pub fn with_ignore_iou(mut self, thresh: f32) -> Self {
        self.ignore_iou_thresh = thresh;
        self
    }

    pub fn grid_sizes(&self) -> Vec<usize> {
        self.strides
            .iter()
            .map(|s| (self.image_size / s) as usize)
            .collect()
    }

    pub fn encode(&self, mode: DataMode, boxes: &[BoxLabel]) -> DatasetResult<Label> {
        if let Some(b) = boxes.iter().find(|b| b.class_id >= self.num_classes) {
            return Err(VocDatasetError::Other(format!(
                "class id {} exceeds {} classes",
                b.class_id, self.num_classes
            )));
        }
        match mode {
            DataMode::Bbox => Ok(Label::Bbox(boxes.to_vec())),
            DataMode::Yolo => Ok(Label::Yolo(self.encode_yolo(boxes))),
        }
    }

    fn encode_yolo(&self, boxes: &[BoxLabel]) -> YoloTarget {
        let grids = self.grid_sizes();
        let mut scales: Vec<ScaleTarget> = grids
            .iter()
            .enumerate()
            .map(|(s, g)| ScaleTarget::zeros(*g, self.anchors.per_scale(s).len()))
            .collect();

        for b in boxes {
            let [cx, cy, w, h] = b.center_size();
            if w <= 0.0 || h <= 0.0 {
                continue;
            }
            let mut ranked: Vec<(f32, usize, usize)> = Vec::new();
            for s in 0..self.anchors.num_scales() {
                for (a, anchor) in self.anchors.per_scale(s).iter().enumerate() {
                    ranked.push((wh_iou([w, h], *anchor), s, a));
                }
            }
            ranked.sort_by(|x, y| y.0.total_cmp(&x.0));

            let mut has_anchor = vec![false; scales.len()];
            for (iou, s, a) in ranked {
                let target = &mut scales[s];
                let g = target.grid;
                let col = ((cx * g as f32) as usize).min(g - 1);
                let row = ((cy * g as f32) as usize).min(g - 1);
                let cell = target.cell_mut(a, row, col);
                let taken = cell[0] == 1.0;
                if !taken && !has_anchor[s] {
                    cell.copy_from_slice(&[
                        1.0,
                        cx * g as f32 - col as f32,
                        cy * g as f32 - row as f32,
                        w * g as f32,
                        h * g as f32,
                        b.class_id as f32,
                    ]);
                    has_anchor[s] = true;
                } else if !taken && iou > self.ignore_iou_thresh {
                    cell[0] = -1.0;
                }
            }
        }
        YoloTarget { scales }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> LabelEncoder {
        LabelEncoder::for_image_size(64).unwrap()
    }

    #[test]
    fn grid_sizes_follow_strides() {
        assert_eq!(encoder().grid_sizes(), vec![2, 4, 8]);
        assert_eq!(
            LabelEncoder::for_image_size(416).unwrap().grid_sizes(),
            vec![13, 26, 52]
        );
    }

    #[test]
    fn rejects_indivisible_image_size() {
        assert!(LabelEncoder::for_image_size(100).is_err());
    }

    #[test]
    fn rejects_zero_image_size() {
        let err = LabelEncoder::for_image_size(0).unwrap_err();
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn bbox_mode_passes_boxes_through() {
        let boxes = vec![BoxLabel {
            class_id: 3,
            bbox: [0.1, 0.1, 0.4, 0.5],
        }];
        let label = encoder().encode(DataMode::Bbox, &boxes).unwrap();
        assert_eq!(label, Label::Bbox(boxes));
    }

    #[test]
    fn yolo_assigns_one_anchor_per_scale() {
        // Large centered box: best anchor is the biggest stride-32 anchor.
        let boxes = vec![BoxLabel {
            class_id: 14,
            bbox: [0.05, 0.1, 0.95, 0.9],
        }];
        let Label::Yolo(target) = encoder().encode(DataMode::Yolo, &boxes).unwrap() else {
            panic!("expected yolo label");
        };
        assert_eq!(target.scales.len(), 3);
        for scale in &target.scales {
            assert_eq!(scale.assigned(), 1);
        }
        let coarse = &target.scales[0];
        // center (0.5, 0.5) on a 2x2 grid lands in cell (1, 1) at offset 0.
        let cell = coarse.cell(2, 1, 1);
        assert_eq!(cell[0], 1.0);
        assert!(cell[1].abs() < 1e-6);
        assert!(cell[2].abs() < 1e-6);
        assert!((cell[3] - 0.9 * 2.0).abs() < 1e-5);
        assert!((cell[4] - 0.8 * 2.0).abs() < 1e-5);
        assert_eq!(cell[5], 14.0);
    }

    #[test]
    fn yolo_marks_close_runner_up_as_ignored() {
        // Equal anchors on one scale: the second one is a perfect but unassigned match.
        let anchors = AnchorSet(vec![vec![[0.5, 0.5], [0.5, 0.5]]]);
        let enc = LabelEncoder::new(32, anchors, vec![32]).unwrap();
        let boxes = vec![BoxLabel {
            class_id: 0,
            bbox: [0.25, 0.25, 0.75, 0.75],
        }];
        let Label::Yolo(target) = enc.encode(DataMode::Yolo, &boxes).unwrap() else {
            panic!("expected yolo label");
        };
        let scale = &target.scales[0];
        let objectness: Vec<f32> = (0..2).map(|a| scale.cell(a, 0, 0)[0]).collect();
        assert!(objectness.contains(&1.0));
        assert!(objectness.contains(&-1.0));
    }

    #[test]
    fn empty_annotations_encode_to_background() {
        let Label::Yolo(target) = encoder().encode(DataMode::Yolo, &[]).unwrap() else {
            panic!("expected yolo label");
        };
        assert!(target.scales.iter().all(|s| s.data.iter().all(|v| *v == 0.0)));
    }

    #[test]
    fn rejects_out_of_range_class() {
        let boxes = vec![BoxLabel {
            class_id: 20,
            bbox: [0.1, 0.1, 0.2, 0.2],
        }];
        assert!(encoder().encode(DataMode::Bbox, &boxes).is_err());
    }

    #[test]
    fn wh_iou_is_one_for_identical_shapes() {
        assert!((wh_iou([0.3, 0.2], [0.3, 0.2]) - 1.0).abs() < 1e-6);
        assert!(wh_iou([0.1, 0.1], [0.2, 0.2]) < 0.3);
    }
}
