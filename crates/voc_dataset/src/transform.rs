//! Image resize/normalization pipeline that keeps boxes aligned with the pixels.

use crate::types::{BoxLabel, DatasetResult, ImageTensor, ResizeMode, VocDatasetError};
use image::imageops::FilterType;
use rand::{Rng, SeedableRng};

/// Per-channel `(x - mean) / std`, applied after scaling pixels to 0..1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    pub const IMAGENET: Normalization = Normalization {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };
}

impl Default for Normalization {
    fn default() -> Self {
        Self::IMAGENET
    }
}

#[derive(Debug, Clone)]
pub struct TransformPipeline {
    pub target_size: Option<(u32, u32)>,
    pub resize_mode: ResizeMode,
    pub flip_horizontal_prob: f32,
    pub normalization: Option<Normalization>,
    pub seed: Option<u64>,
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self {
            target_size: None,
            resize_mode: ResizeMode::Force,
            flip_horizontal_prob: 0.0,
            normalization: None,
            seed: None,
        }
    }
}

impl TransformPipeline {
    /// Square resize to `dimension` followed by ImageNet normalization.
    pub fn normalization(dimension: u32) -> Self {
        TransformPipelineBuilder::new()
            .target_size(Some((dimension, dimension)))
            .resize_mode(ResizeMode::Force)
            .normalization(Some(Normalization::IMAGENET))
            .build()
    }

    pub fn describe(&self) -> String {
        let ts = self
            .target_size
            .map(|(w, h)| format!("{}x{}", w, h))
            .unwrap_or_else(|| "none".to_string());
        format!(
            "target_size={} resize={:?} flip_p={:.2} normalize={} seed={}",
            ts,
            self.resize_mode,
            self.flip_horizontal_prob,
            self.normalization.is_some(),
            self.seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string())
        )
    }

    /// Transform one image and its boxes. `sample_key` mixes into the seed so seeded
    /// pipelines stay deterministic per sample.
    pub fn apply(
        &self,
        img: image::RgbImage,
        mut boxes: Vec<BoxLabel>,
        sample_key: u64,
    ) -> DatasetResult<(ImageTensor, Vec<BoxLabel>)> {
        let mut rng_local;
        let mut seeded_rng;
        let rng: &mut dyn rand::RngCore = if let Some(seed) = self.seed {
            seeded_rng = rand::rngs::StdRng::seed_from_u64(seed ^ sample_key);
            &mut seeded_rng
        } else {
            rng_local = rand::rng();
            &mut rng_local
        };

        let (mut img, mut boxes) = match self.target_size {
            None => (img, boxes),
            Some((w, h)) => match self.resize_mode {
                ResizeMode::Force => (
                    image::imageops::resize(&img, w, h, FilterType::Triangle),
                    boxes,
                ),
                ResizeMode::Letterbox => {
                    let (src_w, src_h) = img.dimensions();
                    let (canvas, pad_w, pad_h, new_w, new_h) = letterbox_resize(&img, w, h)?;
                    for b in boxes.iter_mut() {
                        letterbox_box(b, (src_w, src_h), (new_w, new_h), (pad_w, pad_h), (w, h));
                    }
                    (canvas, boxes)
                }
            },
        };

        maybe_hflip(&mut img, &mut boxes, self.flip_horizontal_prob, rng);
        Ok((to_chw(&img, self.normalization.as_ref()), boxes))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransformPipelineBuilder {
    inner: TransformPipeline,
}

impl TransformPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn target_size(mut self, size: Option<(u32, u32)>) -> Self {
        self.inner.target_size = size;
        self
    }
    pub fn resize_mode(mut self, mode: ResizeMode) -> Self {
        self.inner.resize_mode = mode;
        self
    }
    pub fn flip_horizontal_prob(mut self, p: f32) -> Self {
        self.inner.flip_horizontal_prob = p;
        self
    }
    pub fn normalization(mut self, norm: Option<Normalization>) -> Self {
        self.inner.normalization = norm;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.inner.seed = seed;
        self
    }
    pub fn build(self) -> TransformPipeline {
        self.inner
    }
}

/// CHW conversion with pixels scaled to 0..1 and optionally normalized.
pub fn to_chw(img: &image::RgbImage, norm: Option<&Normalization>) -> ImageTensor {
    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; plane * ImageTensor::CHANNELS];
    for (x, y, pixel) in img.enumerate_pixels() {
        let base = (y * width + x) as usize;
        for c in 0..ImageTensor::CHANNELS {
            let mut v = pixel[c] as f32 / 255.0;
            if let Some(n) = norm {
                v = (v - n.mean[c]) / n.std[c];
            }
            data[c * plane + base] = v;
        }
    }
    ImageTensor {
        data,
        width,
        height,
    }
}

fn letterbox_resize(
    img: &image::RgbImage,
    target_w: u32,
    target_h: u32,
) -> DatasetResult<(image::RgbImage, u32, u32, u32, u32)> {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 || target_w == 0 || target_h == 0 {
        return Err(VocDatasetError::Other(format!(
            "cannot letterbox {w}x{h} into {target_w}x{target_h}"
        )));
    }
    let scale = f32::min(target_w as f32 / w as f32, target_h as f32 / h as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, target_w);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, target_h);
    let resized = image::imageops::resize(img, new_w, new_h, FilterType::Triangle);

    let pad_w = (target_w - new_w) / 2;
    let pad_h = (target_h - new_h) / 2;

    let mut canvas = image::RgbImage::new(target_w, target_h);
    image::imageops::replace(&mut canvas, &resized, pad_w.into(), pad_h.into());

    Ok((canvas, pad_w, pad_h, new_w, new_h))
}

fn letterbox_box(
    b: &mut BoxLabel,
    src: (u32, u32),
    resized: (u32, u32),
    pad: (u32, u32),
    target: (u32, u32),
) {
    let scale_x = resized.0 as f32 / src.0 as f32;
    let scale_y = resized.1 as f32 / src.1 as f32;
    let px = [
        b.bbox[0] * src.0 as f32,
        b.bbox[1] * src.1 as f32,
        b.bbox[2] * src.0 as f32,
        b.bbox[3] * src.1 as f32,
    ];
    b.bbox = [
        (px[0] * scale_x + pad.0 as f32) / target.0 as f32,
        (px[1] * scale_y + pad.1 as f32) / target.1 as f32,
        (px[2] * scale_x + pad.0 as f32) / target.0 as f32,
        (px[3] * scale_y + pad.1 as f32) / target.1 as f32,
    ];
    for v in b.bbox.iter_mut() {
        *v = v.clamp(0.0, 1.0);
    }
}

pub(crate) fn maybe_hflip(
    img: &mut image::RgbImage,
    boxes: &mut [BoxLabel],
    prob: f32,
    rng: &mut dyn rand::RngCore,
) {
    if prob <= 0.0 {
        return;
    }
    if rng.random_range(0.0..1.0) < prob {
        image::imageops::flip_horizontal_in_place(img);
        for b in boxes.iter_mut() {
            let x0 = b.bbox[0];
            let x1 = b.bbox[2];
            b.bbox[0] = (1.0 - x1).clamp(0.0, 1.0);
            b.bbox[2] = (1.0 - x0).clamp(0.0, 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rng;

    fn boxed(bbox: [f32; 4]) -> Vec<BoxLabel> {
        vec![BoxLabel { class_id: 0, bbox }]
    }

    #[test]
    fn hflip_boxes_are_inverted() {
        let mut img = image::RgbImage::new(2, 2);
        let mut boxes = boxed([0.25, 0.0, 0.75, 1.0]);
        let mut rng = rng();
        maybe_hflip(&mut img, &mut boxes, 1.0, &mut rng);
        let flipped = boxes[0].bbox;
        assert!((flipped[0] - 0.25).abs() < 1e-6);
        assert!((flipped[2] - 0.75).abs() < 1e-6);
        assert!(flipped[0] < flipped[2]);
    }

    #[test]
    fn normalization_resizes_to_square() {
        let img = image::RgbImage::from_pixel(10, 6, image::Rgb([255, 0, 0]));
        let pipeline = TransformPipeline::normalization(8);
        let (tensor, boxes) = pipeline.apply(img, boxed([0.1, 0.2, 0.5, 0.6]), 0).unwrap();
        assert_eq!(tensor.shape(), [3, 8, 8]);
        assert_eq!(tensor.data.len(), 3 * 8 * 8);
        // Force resize keeps normalized coordinates untouched.
        assert_eq!(boxes[0].bbox, [0.1, 0.2, 0.5, 0.6]);
        let red = (1.0 - 0.485) / 0.229;
        assert!((tensor.data[0] - red).abs() < 0.05);
        let green = (0.0 - 0.456) / 0.224;
        assert!((tensor.data[64] - green).abs() < 1e-4);
    }

    #[test]
    fn letterbox_moves_boxes_into_padded_frame() {
        // 20x10 into 20x20: image occupies rows 5..15.
        let img = image::RgbImage::new(20, 10);
        let pipeline = TransformPipelineBuilder::new()
            .target_size(Some((20, 20)))
            .resize_mode(ResizeMode::Letterbox)
            .build();
        let (tensor, boxes) = pipeline.apply(img, boxed([0.0, 0.0, 1.0, 1.0]), 0).unwrap();
        assert_eq!(tensor.shape(), [3, 20, 20]);
        let b = boxes[0].bbox;
        assert!((b[0] - 0.0).abs() < 1e-6);
        assert!((b[1] - 0.25).abs() < 1e-6);
        assert!((b[2] - 1.0).abs() < 1e-6);
        assert!((b[3] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn without_target_size_pixels_are_scaled_only() {
        let img = image::RgbImage::from_pixel(3, 2, image::Rgb([0, 51, 255]));
        let (tensor, _) = TransformPipeline::default().apply(img, Vec::new(), 0).unwrap();
        assert_eq!(tensor.shape(), [3, 2, 3]);
        assert_eq!(tensor.data[0], 0.0);
        assert!((tensor.data[6] - 0.2).abs() < 1e-6);
        assert_eq!(tensor.data[12], 1.0);
    }
}
