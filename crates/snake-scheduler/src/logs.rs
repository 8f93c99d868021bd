//! Log sinks.
//!
//! Container output either belongs to a job, in which case it streams to
//! the service's per-job log, or to plumbing like teardown, where only a
//! local trace makes sense. Push failures are logged and dropped; log
//! delivery never fails a pipeline.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use snake_core::client::Client;
use snake_core::cloud::LogSink;

/// Sink that ships output to the service's log stream for one job.
pub struct RemoteSink {
    client: Arc<dyn Client>,
    pipeline_id: i64,
    job_id: i64,
}

impl RemoteSink {
    pub fn new(client: Arc<dyn Client>, pipeline_id: i64, job_id: i64) -> Self {
        Self {
            client,
            pipeline_id,
            job_id,
        }
    }
}

#[async_trait]
impl LogSink for RemoteSink {
    async fn output(&self, chunk: &str) {
        if let Err(err) = self
            .client
            .push_logs(self.pipeline_id, self.job_id, chunk)
            .await
        {
            warn!(
                pipeline = self.pipeline_id,
                job = self.job_id,
                error = %err,
                "Unable to push logs"
            );
        }
    }
}

/// Sink that only traces output locally.
pub struct DebugSink {
    scope: &'static str,
}

impl DebugSink {
    pub fn new(scope: &'static str) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl LogSink for DebugSink {
    async fn output(&self, chunk: &str) {
        debug!(scope = self.scope, "{}", chunk.trim_end());
    }

    async fn command(&self, cmd: &[String]) {
        debug!(scope = self.scope, ?cmd, "exec");
    }
}
