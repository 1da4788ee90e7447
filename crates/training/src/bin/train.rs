use clap::Parser;
use tracing_subscriber::EnvFilter;
use training::{run_train, TrainArgs};

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    run_train(TrainArgs::parse())
}
