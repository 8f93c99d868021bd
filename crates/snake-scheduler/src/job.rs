//! Execution of a single pipeline job inside its own container.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use snake_config::PipelineConfig;
use snake_core::cloud::{Cloud, Container, ExecConfig, LogSink};
use snake_core::task::Job;
use snake_core::{Error, Result};

use crate::sidecar::{rand_suffix, Sidecar};

const DEFAULT_SHELL: &str = "sh";

/// Runs one job's commands against the shared sidecar workspace.
///
/// The job gets its own container; on teardown the container is handed to
/// the utilization drain instead of being destroyed inline, so a slow
/// removal never inflates pipeline latency.
pub struct JobProcess {
    cloud: Arc<dyn Cloud>,
    utilization: mpsc::Sender<Container>,
    token: CancellationToken,
    pipeline_id: i64,
    job: Job,

    container: Option<Container>,
}

impl JobProcess {
    pub fn new(
        cloud: Arc<dyn Cloud>,
        utilization: mpsc::Sender<Container>,
        token: CancellationToken,
        pipeline_id: i64,
        job: Job,
    ) -> Self {
        Self {
            cloud,
            utilization,
            token,
            pipeline_id,
            job,
            container: None,
        }
    }

    pub async fn run(
        &mut self,
        config: &PipelineConfig,
        sidecar: &Sidecar,
        sink: &dyn LogSink,
    ) -> Result<()> {
        let Some(job_config) = config.jobs.get(&self.job.name) else {
            return Err(Error::Config(format!(
                "job {:?} is not defined in the pipeline config",
                self.job.name
            )));
        };

        let image = job_config.image.as_deref().unwrap_or(&config.image);
        let shell = job_config.shell.as_deref().unwrap_or(DEFAULT_SHELL);

        if !self.guard(self.cloud.has_image(image)).await? {
            sink.output(&format!("pulling docker image: {image}\n")).await;
            self.guard(self.cloud.pull_image(image, sink)).await?;
        }

        let name = format!(
            "snake-runner-job-{}-{}-{}",
            self.pipeline_id,
            self.job.id,
            rand_suffix(10)
        );

        let container = self
            .guard(
                self.cloud
                    .create_container(image, &name, &sidecar.pipeline_volumes()),
            )
            .await?;
        self.container = Some(container.clone());

        // job-level variables win over pipeline-level ones
        let mut variables: BTreeMap<&str, &str> = BTreeMap::new();
        for (key, value) in &config.variables {
            variables.insert(key.as_str(), value.as_str());
        }
        for (key, value) in &job_config.variables {
            variables.insert(key.as_str(), value.as_str());
        }
        let env: Vec<String> = variables
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        for command in &job_config.commands {
            sink.output(&format!("\n$ {command}\n")).await;

            let exec = ExecConfig::attached(vec![
                shell.to_string(),
                "-c".to_string(),
                command.clone(),
            ])
            .with_env(env.clone());

            self.guard(self.cloud.exec(&container, exec, sink)).await?;
        }

        Ok(())
    }

    /// Hand the job container to the utilization drain.
    pub async fn destroy(&mut self) {
        let Some(container) = self.container.take() else {
            return;
        };

        if let Err(err) = self.utilization.send(container).await {
            warn!(
                pipeline = self.pipeline_id,
                job = self.job.id,
                container = %err.0.name,
                "Utilization channel closed, container left to startup cleanup"
            );
        }
    }

    /// Race an operation against this job's cancellation.
    async fn guard<T>(&self, operation: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        match self.token.run_until_cancelled(operation).await {
            Some(result) => result,
            None => Err(Error::Cancelled),
        }
    }
}
