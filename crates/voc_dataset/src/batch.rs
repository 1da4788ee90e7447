//! Collation of YOLO samples into Burn tensors.

use crate::types::{DatasetResult, Label, Sample, VocDatasetError, TARGET_FIELDS};
use burn::tensor::{backend::Backend, Tensor, TensorData};

pub struct YoloBatch<B: Backend> {
    /// `[batch, 3, height, width]`.
    pub images: Tensor<B, 4>,
    /// One `[batch, anchors, grid, grid, 6]` tensor per scale, coarse first.
    pub targets: Vec<Tensor<B, 5>>,
}

impl<B: Backend> YoloBatch<B> {
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn collate_yolo<B: Backend>(
    samples: &[Sample],
    device: &B::Device,
) -> DatasetResult<YoloBatch<B>> {
    let first = samples
        .first()
        .ok_or_else(|| VocDatasetError::Other("cannot collate empty batch".to_string()))?;
    let (width, height) = (first.image.width, first.image.height);
    let scale_shapes: Vec<[usize; 4]> = match &first.label {
        Label::Yolo(t) => t.scales.iter().map(|s| s.shape()).collect(),
        Label::Bbox(_) => {
            return Err(VocDatasetError::Other(
                "collate_yolo needs yolo-mode samples".to_string(),
            ))
        }
    };

    let batch = samples.len();
    let mut images: Vec<f32> = Vec::with_capacity(batch * first.image.data.len());
    let mut targets: Vec<Vec<f32>> = scale_shapes
        .iter()
        .map(|s| Vec::with_capacity(batch * s.iter().product::<usize>()))
        .collect();

    for sample in samples {
        if (sample.image.width, sample.image.height) != (width, height) {
            return Err(VocDatasetError::Other(format!(
                "batch contains varying image sizes: {}x{} vs {}x{}; set a target size",
                sample.image.width, sample.image.height, width, height
            )));
        }
        images.extend_from_slice(&sample.image.data);
        let Label::Yolo(target) = &sample.label else {
            return Err(VocDatasetError::Other(
                "collate_yolo needs yolo-mode samples".to_string(),
            ));
        };
        if target.scales.len() != scale_shapes.len()
            || target
                .scales
                .iter()
                .zip(&scale_shapes)
                .any(|(s, shape)| s.shape() != *shape)
        {
            return Err(VocDatasetError::Other(
                "batch contains mismatched target grids".to_string(),
            ));
        }
        for (buf, scale) in targets.iter_mut().zip(&target.scales) {
            buf.extend_from_slice(&scale.data);
        }
    }

    let images = Tensor::<B, 4>::from_data(
        TensorData::new(images, [batch, 3, height as usize, width as usize]),
        device,
    );
    let targets = targets
        .into_iter()
        .zip(&scale_shapes)
        .map(|(buf, [a, g1, g2, f])| {
            debug_assert_eq!(*f, TARGET_FIELDS);
            Tensor::<B, 5>::from_data(TensorData::new(buf, [batch, *a, *g1, *g2, *f]), device)
        })
        .collect();

    Ok(YoloBatch { images, targets })
}
