//! snake-runner: a CI pipeline runner agent.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use snake_config::RunnerConfig;

mod client;
mod runner;

#[derive(Parser)]
#[command(name = "snake-runner")]
#[command(
    about = "Polls the CI service for pipelines and runs their jobs in containers",
    long_about = None
)]
struct Cli {
    /// Path to the runner configuration file
    #[arg(
        long,
        env = "SNAKE_RUNNER_CONFIG",
        default_value = "/etc/snake-runner/snake-runner.yaml"
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = RunnerConfig::load(&cli.config)
        .with_context(|| format!("unable to load config {}", cli.config.display()))?;

    info!(
        name = %config.name,
        master = %config.master_address,
        "snake-runner starting"
    );

    runner::Runner::new(config).run().await
}
