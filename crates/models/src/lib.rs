//! Burn detection models for the VOC training harness.
//!
//! `YoloV3Tiny` is a small strided conv backbone with one 1x1 prediction head per
//! output scale. Heads are ordered coarse to fine (strides 32, 16, 8), the same
//! order the label encoder uses for its anchor scales.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::leaky_relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Values predicted per anchor before the class logits: objectness, x, y, w, h.
pub const BOX_FIELDS: usize = 5;

const LEAKY_SLOPE: f64 = 0.1;
const NUM_STAGES: usize = 5;
/// Stage outputs that feed heads, in head order (stride 32, 16, 8).
const HEAD_STAGES: [usize; 3] = [4, 3, 2];

#[derive(Debug, Clone)]
pub struct YoloV3TinyConfig {
    pub num_classes: usize,
    pub anchors_per_scale: usize,
    /// Channels of the stem; every stage doubles it.
    pub width: usize,
}

impl Default for YoloV3TinyConfig {
    fn default() -> Self {
        Self {
            num_classes: 20,
            anchors_per_scale: 3,
            width: 16,
        }
    }
}

impl YoloV3TinyConfig {
    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    /// Channels per head output: `anchors * (5 + classes)`.
    pub fn head_channels(&self) -> usize {
        self.anchors_per_scale * (BOX_FIELDS + self.num_classes)
    }

    fn stage_channels(&self, stage: usize) -> usize {
        self.width.max(1) << (stage + 1)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> YoloV3Tiny<B> {
        YoloV3Tiny::new(self.clone(), device)
    }
}

/// Downsample by 2, then refine at the same resolution.
#[derive(Debug, Module)]
pub struct Stage<B: Backend> {
    down: Conv2d<B>,
    refine: Conv2d<B>,
}

impl<B: Backend> Stage<B> {
    fn new(c_in: usize, c_out: usize, device: &B::Device) -> Self {
        let down = Conv2dConfig::new([c_in, c_out], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let refine = Conv2dConfig::new([c_out, c_out], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        Self { down, refine }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = leaky_relu(self.down.forward(x), LEAKY_SLOPE);
        leaky_relu(self.refine.forward(x), LEAKY_SLOPE)
    }
}

#[derive(Debug, Module)]
pub struct YoloV3Tiny<B: Backend> {
    stem: Conv2d<B>,
    stages: Vec<Stage<B>>,
    heads: Vec<Conv2d<B>>,
    num_classes: usize,
    anchors_per_scale: usize,
    width: usize,
}

impl<B: Backend> YoloV3Tiny<B> {
    pub fn new(cfg: YoloV3TinyConfig, device: &B::Device) -> Self {
        let width = cfg.width.max(1);
        let stem = Conv2dConfig::new([3, width], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let mut stages = Vec::with_capacity(NUM_STAGES);
        let mut c_in = width;
        for stage in 0..NUM_STAGES {
            let c_out = cfg.stage_channels(stage);
            stages.push(Stage::new(c_in, c_out, device));
            c_in = c_out;
        }
        let heads = HEAD_STAGES
            .iter()
            .map(|&stage| {
                Conv2dConfig::new([cfg.stage_channels(stage), cfg.head_channels()], [1, 1])
                    .init(device)
            })
            .collect();
        Self {
            stem,
            stages,
            heads,
            num_classes: cfg.num_classes,
            anchors_per_scale: cfg.anchors_per_scale,
            width,
        }
    }

    pub fn config(&self) -> YoloV3TinyConfig {
        YoloV3TinyConfig {
            num_classes: self.num_classes,
            anchors_per_scale: self.anchors_per_scale,
            width: self.width,
        }
    }

    /// Raw predictions per scale, coarse first, each `[N, A, S, S, 5 + C]`.
    ///
    /// Nothing is squashed: objectness and class values are logits, x/y go through
    /// a sigmoid in the loss and w/h are log-space offsets from the anchor.
    pub fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 5>> {
        let mut x = leaky_relu(self.stem.forward(images), LEAKY_SLOPE);
        let mut features = Vec::with_capacity(NUM_STAGES);
        for stage in &self.stages {
            x = stage.forward(x);
            features.push(x.clone());
        }
        HEAD_STAGES
            .iter()
            .zip(&self.heads)
            .map(|(&stage, head)| self.to_grid(head.forward(features[stage].clone())))
            .collect()
    }

    fn to_grid(&self, x: Tensor<B, 4>) -> Tensor<B, 5> {
        let [n, _, h, w] = x.dims();
        x.reshape([
            n,
            self.anchors_per_scale,
            BOX_FIELDS + self.num_classes,
            h,
            w,
        ])
        .permute([0, 1, 3, 4, 2])
    }

    /// One line per layer with channel counts and output stride.
    pub fn summary(&self) -> String {
        let cfg = self.config();
        let mut lines = vec![format!(
            "YoloV3Tiny(classes={}, anchors/scale={}, width={})",
            cfg.num_classes, cfg.anchors_per_scale, cfg.width
        )];
        lines.push(format!("  stem     conv3x3 3 -> {} (stride 1)", cfg.width));
        let mut c_in = cfg.width;
        for stage in 0..NUM_STAGES {
            let c_out = cfg.stage_channels(stage);
            lines.push(format!(
                "  stage{}   conv3x3/2 {c_in} -> {c_out}, conv3x3 {c_out} -> {c_out} (stride {})",
                stage + 1,
                2usize << stage
            ));
            c_in = c_out;
        }
        for (i, &stage) in HEAD_STAGES.iter().enumerate() {
            lines.push(format!(
                "  head{i}    conv1x1 {} -> {} (stride {})",
                cfg.stage_channels(stage),
                cfg.head_channels(),
                2usize << stage
            ));
        }
        lines.join("\n")
    }
}

pub mod prelude {
    pub use super::{YoloV3Tiny, YoloV3TinyConfig, BOX_FIELDS};
}
