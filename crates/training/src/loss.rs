//! Multi-scale YOLOv3 loss over encoded anchor targets.
//!
//! Target cells carry `[objectness, x, y, w, h, class]` with objectness `1` for an
//! assigned anchor, `0` for background and `-1` for ignored anchors. `x, y` are
//! cell-relative and `w, h` are in grid units.

use burn::tensor::activation::{log_softmax, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use models::BOX_FIELDS;
use serde::{Deserialize, Serialize};
use voc_dataset::{AnchorSet, TARGET_FIELDS};

const LOG_EPS: f32 = 1e-16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    #[serde(rename = "box")]
    pub box_weight: f32,
    pub obj: f32,
    pub noobj: f32,
    pub class: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            box_weight: 10.0,
            obj: 1.0,
            noobj: 10.0,
            class: 1.0,
        }
    }
}

/// Unweighted loss terms summed over scales.
#[derive(Debug, Clone)]
pub struct YoloLossParts<B: Backend> {
    pub box_loss: Tensor<B, 1>,
    pub obj: Tensor<B, 1>,
    pub noobj: Tensor<B, 1>,
    pub class: Tensor<B, 1>,
}

/// Host copy of [`YoloLossParts`] for logging and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LossValues {
    pub box_loss: f32,
    pub obj: f32,
    pub noobj: f32,
    pub class: f32,
    pub total: f32,
}

impl<B: Backend> YoloLossParts<B> {
    pub fn total(&self, weights: &LossWeights) -> Tensor<B, 1> {
        self.box_loss.clone().mul_scalar(weights.box_weight)
            + self.obj.clone().mul_scalar(weights.obj)
            + self.noobj.clone().mul_scalar(weights.noobj)
            + self.class.clone().mul_scalar(weights.class)
    }

    pub fn values(&self, weights: &LossWeights) -> anyhow::Result<LossValues> {
        Ok(LossValues {
            box_loss: scalar_value(self.box_loss.clone())?,
            obj: scalar_value(self.obj.clone())?,
            noobj: scalar_value(self.noobj.clone())?,
            class: scalar_value(self.class.clone())?,
            total: scalar_value(self.total(weights))?,
        })
    }
}

impl std::ops::AddAssign for LossValues {
    fn add_assign(&mut self, rhs: Self) {
        self.box_loss += rhs.box_loss;
        self.obj += rhs.obj;
        self.noobj += rhs.noobj;
        self.class += rhs.class;
        self.total += rhs.total;
    }
}

impl LossValues {
    pub fn scaled(self, factor: f32) -> Self {
        Self {
            box_loss: self.box_loss * factor,
            obj: self.obj * factor,
            noobj: self.noobj * factor,
            class: self.class * factor,
            total: self.total * factor,
        }
    }
}

/// Read the first element of a tensor back to the host.
pub fn scalar_value<B: Backend>(t: Tensor<B, 1>) -> anyhow::Result<f32> {
    first_f32(t.into_data())
}

fn first_f32(data: TensorData) -> anyhow::Result<f32> {
    let values = data
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("failed to read loss value: {e:?}"))?;
    values
        .first()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("loss tensor is empty"))
}

/// Loss for raw head outputs `[N, A, S, S, 5 + C]` against targets `[N, A, S, S, 6]`.
///
/// Both slices and `anchors` are ordered coarse to fine.
pub fn yolo_loss<B: Backend>(
    predictions: &[Tensor<B, 5>],
    targets: &[Tensor<B, 5>],
    anchors: &AnchorSet,
) -> anyhow::Result<YoloLossParts<B>> {
    anyhow::ensure!(
        predictions.len() == targets.len() && targets.len() == anchors.num_scales(),
        "got {} prediction scales, {} target scales and {} anchor scales",
        predictions.len(),
        targets.len(),
        anchors.num_scales()
    );
    let device = match predictions.first() {
        Some(p) => p.device(),
        None => anyhow::bail!("yolo_loss needs at least one scale"),
    };
    let mut parts = YoloLossParts {
        box_loss: Tensor::<B, 1>::zeros([1], &device),
        obj: Tensor::<B, 1>::zeros([1], &device),
        noobj: Tensor::<B, 1>::zeros([1], &device),
        class: Tensor::<B, 1>::zeros([1], &device),
    };
    for (scale, (pred, target)) in predictions.iter().zip(targets).enumerate() {
        let scale_parts = scale_loss(pred.clone(), target.clone(), anchors.per_scale(scale))?;
        parts.box_loss = parts.box_loss + scale_parts.box_loss;
        parts.obj = parts.obj + scale_parts.obj;
        parts.noobj = parts.noobj + scale_parts.noobj;
        parts.class = parts.class + scale_parts.class;
    }
    Ok(parts)
}

fn scale_loss<B: Backend>(
    pred: Tensor<B, 5>,
    target: Tensor<B, 5>,
    anchors: &[[f32; 2]],
) -> anyhow::Result<YoloLossParts<B>> {
    let [n, a, gy, gx, fields] = pred.dims();
    anyhow::ensure!(
        target.dims() == [n, a, gy, gx, TARGET_FIELDS],
        "target shape {:?} does not match prediction shape {:?}",
        target.dims(),
        pred.dims()
    );
    anyhow::ensure!(
        fields > BOX_FIELDS,
        "predictions carry no class logits"
    );
    anyhow::ensure!(
        anchors.len() == a,
        "{} anchors for {a} predicted anchors per cell",
        anchors.len()
    );
    let num_classes = fields - BOX_FIELDS;
    let device = pred.device();
    let field = |t: &Tensor<B, 5>, range: std::ops::Range<usize>| {
        t.clone().slice([0..n, 0..a, 0..gy, 0..gx, range])
    };

    let t_obj = field(&target, 0..1);
    let obj_mask = t_obj.clone().equal_elem(1.0).float();
    let noobj_mask = t_obj.equal_elem(0.0).float();
    let n_obj = obj_mask.clone().sum().clamp_min(1.0);
    let n_noobj = noobj_mask.clone().sum().clamp_min(1.0);

    let p_obj = field(&pred, 0..1);
    let obj = (bce_with_logits(p_obj.clone(), obj_mask.clone()) * obj_mask.clone()).sum()
        / n_obj.clone();
    let noobj = (bce_with_logits(p_obj.clone(), p_obj.zeros_like()) * noobj_mask).sum() / n_noobj;

    let anchor_grid: Vec<f32> = anchors
        .iter()
        .flat_map(|[w, h]| [w * gx as f32, h * gy as f32])
        .collect();
    let anchor_grid = Tensor::<B, 5>::from_data(TensorData::new(anchor_grid, [1, a, 1, 1, 2]), &device)
        .expand([n, a, gy, gx, 2]);
    let t_wh = (field(&target, 3..5) / anchor_grid).add_scalar(LOG_EPS).log();
    let xy_err = (sigmoid(field(&pred, 1..3)) - field(&target, 1..3))
        .powf_scalar(2.0)
        .sum_dim(4);
    let wh_err = (field(&pred, 3..5) - t_wh).powf_scalar(2.0).sum_dim(4);
    let box_loss = ((xy_err + wh_err) * obj_mask.clone()).sum() / n_obj.clone().mul_scalar(4.0);

    let log_probs = log_softmax(field(&pred, BOX_FIELDS..fields), 4);
    let class_ids = Tensor::<B, 1, Int>::arange(0..num_classes as i64, &device)
        .float()
        .reshape([1, 1, 1, 1, num_classes])
        .expand([n, a, gy, gx, num_classes]);
    let one_hot = (field(&target, 5..6).expand([n, a, gy, gx, num_classes]) - class_ids)
        .abs()
        .lower_elem(0.5)
        .float();
    let class = -((one_hot * log_probs).sum_dim(4) * obj_mask).sum() / n_obj;

    Ok(YoloLossParts {
        box_loss,
        obj,
        noobj,
        class,
    })
}

/// Numerically stable `BCE(sigmoid(x), t)`.
fn bce_with_logits<B: Backend>(logits: Tensor<B, 5>, target: Tensor<B, 5>) -> Tensor<B, 5> {
    let soft = logits.clone().abs().neg().exp().add_scalar(1.0).log();
    logits.clone().clamp_min(0.0) - logits * target + soft
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    type B = NdArray<f32>;

    fn one_scale_anchors() -> AnchorSet {
        AnchorSet(vec![vec![[0.5, 0.5]]])
    }

    fn target(cells: &[(usize, [f32; 6])]) -> Tensor<B, 5> {
        let mut data = vec![0.0f32; 4 * TARGET_FIELDS];
        for (cell, values) in cells {
            data[cell * TARGET_FIELDS..(cell + 1) * TARGET_FIELDS].copy_from_slice(values);
        }
        Tensor::from_data(TensorData::new(data, [1, 1, 2, 2, TARGET_FIELDS]), &Default::default())
    }

    fn zero_pred() -> Tensor<B, 5> {
        Tensor::zeros([1, 1, 2, 2, BOX_FIELDS + 3], &Default::default())
    }

    #[test]
    fn background_only_contributes_noobj() {
        let parts = yolo_loss(&[zero_pred()], &[target(&[])], &one_scale_anchors()).unwrap();
        let v = parts.values(&LossWeights::default()).unwrap();
        assert_eq!(v.box_loss, 0.0);
        assert_eq!(v.obj, 0.0);
        assert_eq!(v.class, 0.0);
        assert!((v.noobj - std::f32::consts::LN_2).abs() < 1e-5);
        assert!((v.total - 10.0 * std::f32::consts::LN_2).abs() < 1e-4);
    }

    #[test]
    fn matched_cell_scores_obj_and_class() {
        // Anchor-sized box centered in cell 0 with class 2: the zero prediction is exact
        // for the box and uniform over the three classes.
        let t = target(&[(0, [1.0, 0.5, 0.5, 1.0, 1.0, 2.0])]);
        let parts = yolo_loss(&[zero_pred()], &[t], &one_scale_anchors()).unwrap();
        let v = parts.values(&LossWeights::default()).unwrap();
        assert!(v.box_loss.abs() < 1e-5);
        assert!((v.obj - std::f32::consts::LN_2).abs() < 1e-5);
        assert!((v.class - 3.0f32.ln()).abs() < 1e-5);
        assert!((v.noobj - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn ignored_cells_contribute_nothing() {
        let cells: Vec<(usize, [f32; 6])> =
            (0..4).map(|c| (c, [-1.0, 0.0, 0.0, 0.0, 0.0, 0.0])).collect();
        let parts = yolo_loss(&[zero_pred()], &[target(&cells)], &one_scale_anchors()).unwrap();
        assert_eq!(parts.values(&LossWeights::default()).unwrap(), LossValues::default());
    }

    #[test]
    fn box_error_grows_with_offset() {
        let t = target(&[(3, [1.0, 0.9, 0.1, 2.0, 0.5, 0.0])]);
        let parts = yolo_loss(&[zero_pred()], &[t], &one_scale_anchors()).unwrap();
        let v = parts.values(&LossWeights::default()).unwrap();
        // (0.5-0.9)^2 + (0.5-0.1)^2 + ln(2)^2 + ln(0.5)^2, averaged over four fields.
        let expected = (0.16 + 0.16 + 2.0 * std::f32::consts::LN_2.powi(2)) / 4.0;
        assert!((v.box_loss - expected).abs() < 1e-4);
    }

    #[test]
    fn readback_errors_are_reported() {
        let ints = TensorData::new(vec![3i64], [1]);
        assert!(first_f32(ints).is_err());
        let empty = TensorData::new(Vec::<f32>::new(), [0]);
        assert!(first_f32(empty).unwrap_err().to_string().contains("empty"));
        assert_eq!(first_f32(TensorData::new(vec![1.5f32], [1])).unwrap(), 1.5);
    }

    #[test]
    fn scale_count_mismatch_fails() {
        let err = yolo_loss(&[zero_pred()], &[target(&[])], &AnchorSet::default()).unwrap_err();
        assert!(err.to_string().contains("anchor scales"));
    }
}
