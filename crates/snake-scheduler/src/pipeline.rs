//! Per-pipeline execution state machine.
//!
//! One `PipelineProcess` runs all jobs of one pipeline in delivered
//! order, owning the sidecar those jobs share. It holds two cancellation
//! tokens: the scheduler-lifetime one and its own. The distinction
//! matters on cancellation: when only the local token fired, the service
//! asked for the cancel and the running job classifies as `CANCELED`;
//! when the scheduler token fired too, the whole runner is terminating
//! and the job classifies as `FAILED` with an explanatory log line.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use snake_config::pipeline::parse_pipeline;
use snake_config::{PipelineConfig, RunnerConfig};
use snake_core::client::Client;
use snake_core::cloud::{Cloud, Container, LogSink};
use snake_core::sshkey::SshKey;
use snake_core::task::{Job, PipelineRun};
use snake_core::{Error, Result, Status};

use crate::job::JobProcess;
use crate::logs::RemoteSink;
use crate::sidecar::{unique_name, Sidecar};

/// Sentinel for "the pipeline itself failed before any specific job";
/// failure propagation then marks every job `FAILED`.
const NO_JOB: i64 = -1;

pub struct PipelineProcess {
    parent_token: CancellationToken,
    token: CancellationToken,
    client: Arc<dyn Client>,
    cloud: Arc<dyn Cloud>,
    runner_config: Arc<RunnerConfig>,
    task: PipelineRun,
    utilization: mpsc::Sender<Container>,
    ssh_key: SshKey,

    status: Status,
    sidecar: Option<Sidecar>,
    config: Option<PipelineConfig>,
}

impl PipelineProcess {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent_token: CancellationToken,
        token: CancellationToken,
        client: Arc<dyn Client>,
        cloud: Arc<dyn Cloud>,
        runner_config: Arc<RunnerConfig>,
        task: PipelineRun,
        utilization: mpsc::Sender<Container>,
        ssh_key: SshKey,
    ) -> Self {
        Self {
            parent_token,
            token,
            client,
            cloud,
            runner_config,
            task,
            utilization,
            ssh_key,
            status: Status::Unknown,
            sidecar: None,
            config: None,
        }
    }

    /// Run the pipeline to completion. Whatever the exit path, the
    /// sidecar is destroyed exactly once.
    pub async fn run(&mut self) -> Result<()> {
        let id = self.task.pipeline.id;
        info!(pipeline = id, "Pipeline started");

        let result = self.execute().await;
        self.destroy().await;

        info!(pipeline = id, status = %self.status, "Pipeline finished");
        result
    }

    async fn execute(&mut self) -> Result<()> {
        let id = self.task.pipeline.id;

        if let Err(err) = self
            .client
            .update_pipeline(id, Status::Running, Some(Utc::now()), None)
            .await
        {
            self.fail(NO_JOB).await;
            return Err(Error::Service(format!(
                "unable to update pipeline status: {err}"
            )));
        }

        self.run_jobs().await?;

        if let Err(err) = self
            .client
            .update_pipeline(id, Status::Success, None, Some(Utc::now()))
            .await
        {
            self.fail(NO_JOB).await;
            return Err(Error::Service(format!(
                "unable to update pipeline status: {err}"
            )));
        }

        Ok(())
    }

    async fn run_jobs(&mut self) -> Result<()> {
        let id = self.task.pipeline.id;
        let jobs = self.task.jobs.clone();
        let total = jobs.len();

        for (index, job) in jobs.iter().enumerate() {
            info!(
                pipeline = id,
                job = job.id,
                "Starting job {}/{}",
                index + 1,
                total
            );

            let (status, result) = self.run_job(job).await;
            if status == Status::Failed {
                self.fail(job.id).await;
            }

            info!(
                pipeline = id,
                job = job.id,
                status = %status,
                "Finished job {}/{}",
                index + 1,
                total
            );

            if let Err(err) = result {
                self.status = status;
                return Err(err);
            }

            if let Err(err) = self
                .client
                .update_job(id, job.id, status, None, Some(Utc::now()))
                .await
            {
                self.fail(job.id).await;
                self.status = Status::Failed;
                return Err(Error::Service(format!(
                    "unable to update job status to {status}, but the job finished: {err}"
                )));
            }
        }

        self.status = Status::Success;
        Ok(())
    }

    /// Run one job and classify the outcome.
    async fn run_job(&mut self, job: &Job) -> (Status, Result<()>) {
        let id = self.task.pipeline.id;

        if let Err(err) = self
            .client
            .update_job(id, job.id, Status::Running, Some(Utc::now()), None)
            .await
        {
            return (
                Status::Failed,
                Err(Error::Service(format!("unable to update job status: {err}"))),
            );
        }

        let sink = RemoteSink::new(self.client.clone(), id, job.id);
        let mut process = JobProcess::new(
            self.cloud.clone(),
            self.utilization.clone(),
            self.token.clone(),
            id,
            job.clone(),
        );

        // the first job brings the workspace up; any failure in that
        // phase is a job failure, cancellation included
        if let Err(err) = self.ensure_workspace(&sink).await {
            process.destroy().await;
            return (Status::Failed, Err(err));
        }

        let result = match (self.sidecar.as_ref(), self.config.as_ref()) {
            (Some(sidecar), Some(config)) => process.run(config, sidecar, &sink).await,
            _ => Err(Error::Internal(
                "sidecar and config must be initialised before running jobs".to_string(),
            )),
        };
        process.destroy().await;

        match result {
            Ok(()) => (Status::Success, Ok(())),
            Err(Error::Cancelled) => {
                if self.parent_token.is_cancelled() {
                    sink.output("\n\nWARNING: snake-runner has been terminated\n")
                        .await;
                    (Status::Failed, Err(Error::Cancelled))
                } else {
                    (Status::Canceled, Err(Error::Cancelled))
                }
            }
            Err(err) => (Status::Failed, Err(err)),
        }
    }

    /// Bring up the sidecar and read the pipeline config on the first
    /// job; later jobs reuse both. Errors are written to the job's
    /// remote log unconditionally.
    async fn ensure_workspace(&mut self, sink: &RemoteSink) -> Result<()> {
        if self.sidecar.is_some() {
            return Ok(());
        }

        let mut sidecar = Sidecar::new(
            self.cloud.clone(),
            unique_name(self.task.pipeline.id),
            format!(
                "{}/{}",
                self.task.project.key, self.task.repository.slug
            ),
            self.runner_config.pipelines_dir.clone(),
            self.ssh_key.clone(),
        );

        let served = match self
            .token
            .run_until_cancelled(sidecar.serve(
                &self.task.clone_url.ssh,
                &self.task.pipeline.commit,
                sink,
            ))
            .await
        {
            None => Err(Error::Cancelled),
            Some(result) => result,
        };

        // even a partially served sidecar owns a container by now;
        // keep it so destroy() tears it down
        self.sidecar = Some(sidecar);

        if let Err(err) = served {
            sink.output(&format!("\nERROR: unable to start sidecar container: {err}\n"))
                .await;
            return Err(err);
        }

        if let Err(err) = self.read_config().await {
            sink.output(&format!("\nERROR: unable to read pipeline config: {err}\n"))
                .await;
            return Err(err);
        }

        Ok(())
    }

    async fn read_config(&mut self) -> Result<()> {
        let filename = &self.task.pipeline.filename;

        let Some(sidecar) = self.sidecar.as_ref() else {
            return Err(Error::Internal("sidecar is not serving".to_string()));
        };
        let Some(container) = sidecar.container() else {
            return Err(Error::Internal("sidecar has no container".to_string()));
        };

        let contents = match self
            .token
            .run_until_cancelled(self.cloud.cat(container, sidecar.container_dir(), filename))
            .await
        {
            None => return Err(Error::Cancelled),
            Some(result) => result.map_err(|err| {
                Error::Cloud(format!(
                    "unable to obtain {filename:?} from the workspace: {err}"
                ))
            })?,
        };

        let config = parse_pipeline(&contents)
            .map_err(|err| Error::Config(format!("unable to parse {filename:?}: {err}")))?;

        self.config = Some(config);
        Ok(())
    }

    /// Failure propagation: jobs before the failing one keep their final
    /// status, the failing job goes `FAILED`, everything after it goes
    /// `SKIPPED`, and the pipeline goes `FAILED`. With the [`NO_JOB`]
    /// sentinel every job goes `FAILED`. Individual update failures are
    /// logged and do not abort the walk.
    async fn fail(&mut self, failed_id: i64) {
        let id = self.task.pipeline.id;
        let now = Some(Utc::now());
        let mut found = false;

        for job in &self.task.jobs {
            let status = if failed_id == NO_JOB {
                Status::Failed
            } else if job.id == failed_id {
                found = true;
                Status::Failed
            } else if !found {
                continue;
            } else {
                Status::Skipped
            };

            info!(pipeline = id, job = job.id, status = %status, "Updating job");

            if let Err(err) = self.client.update_job(id, job.id, status, None, now).await {
                error!(
                    pipeline = id,
                    job = job.id,
                    error = %err,
                    "Unable to update job status to {status}"
                );
            }
        }

        if let Err(err) = self
            .client
            .update_pipeline(id, Status::Failed, None, now)
            .await
        {
            error!(
                pipeline = id,
                error = %err,
                "Unable to update pipeline status to {}",
                Status::Failed
            );
        }
    }

    async fn destroy(&mut self) {
        if let Some(sidecar) = self.sidecar.as_mut() {
            sidecar.destroy().await;
        }
    }
}
