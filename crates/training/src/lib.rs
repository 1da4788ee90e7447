#![recursion_limit = "256"]

pub mod cli;
pub mod config;
pub mod loss;
pub mod trainer;

pub use cli::{run_train, TrainArgs};
pub use config::TrainConfig;
pub use loss::{yolo_loss, LossValues, LossWeights, YoloLossParts};
pub use models::{YoloV3Tiny, YoloV3TinyConfig};
pub use trainer::{load_checkpoint, EpochMetrics, TrainReport, YoloTrainer};

/// Backend alias for training (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
