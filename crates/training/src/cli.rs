use crate::config::TrainConfig;
use crate::trainer::YoloTrainer;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(
    name = "train",
    about = "Train YOLOv3-tiny on a Pascal VOC folder (config: yolo-voc.toml or $YOLO_VOC_CONFIG)"
)]
pub struct TrainArgs {
    /// Config file; replaces the yolo-voc.toml / $YOLO_VOC_CONFIG lookup.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Folder holding the VOC tree (or a VOCdevkit/VOC2012 layout).
    #[arg(long)]
    pub data_folder: Option<PathBuf>,
    /// Number of epochs.
    #[arg(long)]
    pub epochs: Option<usize>,
    /// Batch size.
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Square input size; must be a multiple of 32.
    #[arg(long)]
    pub image_size: Option<u32>,
    /// Seed for the split and shuffles.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Checkpoint output path.
    #[arg(long)]
    pub checkpoint_out: Option<PathBuf>,
    /// Skip logging the model summary.
    #[arg(long)]
    pub no_plot: bool,
}

impl TrainArgs {
    /// Flags take precedence over file and environment values.
    pub fn apply(&self, cfg: &mut TrainConfig) {
        if let Some(v) = &self.data_folder {
            cfg.data_folder = v.clone();
        }
        if let Some(v) = self.epochs {
            cfg.epochs = v;
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v;
        }
        if let Some(v) = self.image_size {
            cfg.image_size = v;
        }
        if let Some(v) = self.seed {
            cfg.seed = Some(v);
        }
        if let Some(v) = &self.checkpoint_out {
            cfg.checkpoint = v.clone();
        }
    }

    pub fn resolve(&self) -> anyhow::Result<TrainConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainConfig::load_from(Some(path.as_path()))?,
            None => TrainConfig::load()?,
        };
        self.apply(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let cfg = args.resolve()?;
    log::info!(
        "training on {} for {} epochs (batch {}, image {})",
        cfg.data_folder.display(),
        cfg.epochs,
        cfg.batch_size,
        cfg.image_size
    );
    let mut trainer = YoloTrainer::new(cfg)?;
    if !args.no_plot {
        trainer = trainer.plot_model();
    }
    let report = trainer.train()?;
    if let Some(loss) = report.final_train_loss() {
        log::info!("final training loss {loss:.4}");
    }
    Ok(())
}
