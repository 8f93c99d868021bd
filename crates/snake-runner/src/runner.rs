//! Runner shell: wires the container provider, the service client and
//! the scheduler together, and reacts to process signals.

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use snake_cloud::DockerCloud;
use snake_config::RunnerConfig;
use snake_core::client::Client;
use snake_core::cloud::Cloud;
use snake_scheduler::Scheduler;

use crate::client::GateClient;

pub struct Runner {
    config: Arc<RunnerConfig>,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Run until a shutdown signal arrives, then drain gracefully.
    pub async fn run(&self) -> anyhow::Result<()> {
        let cloud: Arc<dyn Cloud> = Arc::new(
            DockerCloud::new(
                self.config.docker.network.clone(),
                self.config.docker.volumes.clone(),
            )
            .context("unable to initialize container provider")?,
        );

        cloud
            .cleanup()
            .await
            .context("unable to cleanup old containers")?;

        let client: Arc<dyn Client> = Arc::new(GateClient::new(
            &self.config.master_address,
            &self.config.access_token,
            &self.config.name,
        ));

        let scheduler = Scheduler::start(client, cloud, self.config.clone());

        wait_for_shutdown_signal().await?;
        warn!("Signal received, shutting down");

        scheduler.shutdown().await;

        info!("Runner stopped");
        Ok(())
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("unable to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("unable to listen for interrupt")?;
        }
        _ = terminate.recv() => {}
    }

    Ok(())
}
