//! CI service trait.
//!
//! The central service is the source of truth for pipeline state; the
//! runner talks to it exclusively through this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::sshkey::SshKey;
use crate::status::Status;
use crate::task::Task;
use crate::Result;

/// Operations the runner consumes from the CI service.
#[async_trait]
pub trait Client: Send + Sync {
    /// Ask the service for work. The service may grant a task only when
    /// `has_capacity` is true; it registers `ssh_key` as a deploy key for
    /// the granted pipeline's project and uses `running_pipelines` to
    /// target cancels.
    async fn get_task(
        &self,
        running_pipelines: Vec<i64>,
        has_capacity: bool,
        ssh_key: &SshKey,
    ) -> Result<Option<Task>>;

    /// Report a pipeline status transition. Timestamps are UTC; either
    /// may be absent.
    async fn update_pipeline(
        &self,
        pipeline_id: i64,
        status: Status,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Report a job status transition.
    async fn update_job(
        &self,
        pipeline_id: i64,
        job_id: i64,
        status: Status,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Append a chunk to a job's log stream.
    async fn push_logs(&self, pipeline_id: i64, job_id: i64, text: &str) -> Result<()>;
}
