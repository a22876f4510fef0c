use anyhow::Result;
use aya::include_bytes_aligned;
use clap::Parser;
use runqwatch::{RunqWatchEngine, settings::Settings, telemetry};

#[derive(Debug, Parser)]
#[command(about = "Per-cgroup run queue latency tracker")]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let settings = Settings::new()?;
    telemetry::init_metrics()?;

    let engine = RunqWatchEngine::new(
        settings,
        include_bytes_aligned!(concat!(env!("OUT_DIR"), "/runqwatch")),
    )?;
    engine.run().await
}
