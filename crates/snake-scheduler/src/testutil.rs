//! Mock implementations of the service and container-provider traits,
//! recording every call for assertion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use snake_core::client::Client;
use snake_core::cloud::{Cloud, Container, ExecConfig, LogSink};
use snake_core::sshkey::SshKey;
use snake_core::status::Status;
use snake_core::task::Task;
use snake_core::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientCall {
    GetTask {
        running: Vec<i64>,
        has_capacity: bool,
    },
    UpdatePipeline {
        pipeline: i64,
        status: Status,
        started: bool,
        finished: bool,
    },
    UpdateJob {
        pipeline: i64,
        job: i64,
        status: Status,
        started: bool,
        finished: bool,
    },
}

#[derive(Default)]
pub struct MockClient {
    calls: Mutex<Vec<ClientCall>>,
    tasks: Mutex<VecDeque<Result<Option<Task>>>>,
    fail_update_job: Mutex<Option<(i64, Status)>>,
    fail_update_pipeline: Mutex<Option<Status>>,
    logs: Mutex<String>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn logs(&self) -> String {
        self.logs.lock().unwrap().clone()
    }

    /// Queue a `get_task` response; once the queue is empty, `get_task`
    /// answers "no work".
    pub fn enqueue_task(&self, task: Result<Option<Task>>) {
        self.tasks.lock().unwrap().push_back(task);
    }

    /// Make `update_job` fail for the given job once it reports the given
    /// status.
    pub fn fail_update_job(&self, job: i64, status: Status) {
        *self.fail_update_job.lock().unwrap() = Some((job, status));
    }

    /// Make `update_pipeline` fail when it reports the given status.
    pub fn fail_update_pipeline(&self, status: Status) {
        *self.fail_update_pipeline.lock().unwrap() = Some(status);
    }

    /// Job updates only, in call order, as `(job, status)` pairs.
    pub fn job_updates(&self) -> Vec<(i64, Status)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ClientCall::UpdateJob { job, status, .. } => Some((job, status)),
                _ => None,
            })
            .collect()
    }

    /// Pipeline updates only, in call order.
    pub fn pipeline_updates(&self) -> Vec<Status> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ClientCall::UpdatePipeline { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Client for MockClient {
    async fn get_task(
        &self,
        running_pipelines: Vec<i64>,
        has_capacity: bool,
        _ssh_key: &SshKey,
    ) -> Result<Option<Task>> {
        self.calls.lock().unwrap().push(ClientCall::GetTask {
            running: running_pipelines,
            has_capacity,
        });

        match self.tasks.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(None),
        }
    }

    async fn update_pipeline(
        &self,
        pipeline_id: i64,
        status: Status,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(ClientCall::UpdatePipeline {
            pipeline: pipeline_id,
            status,
            started: started_at.is_some(),
            finished: finished_at.is_some(),
        });

        if *self.fail_update_pipeline.lock().unwrap() == Some(status) {
            return Err(Error::Service("pipeline update rejected".to_string()));
        }

        Ok(())
    }

    async fn update_job(
        &self,
        pipeline_id: i64,
        job_id: i64,
        status: Status,
        started_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(ClientCall::UpdateJob {
            pipeline: pipeline_id,
            job: job_id,
            status,
            started: started_at.is_some(),
            finished: finished_at.is_some(),
        });

        if *self.fail_update_job.lock().unwrap() == Some((job_id, status)) {
            return Err(Error::Service("job update rejected".to_string()));
        }

        Ok(())
    }

    async fn push_logs(&self, _pipeline_id: i64, _job_id: i64, text: &str) -> Result<()> {
        self.logs.lock().unwrap().push_str(text);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloudCall {
    Cleanup,
    HasImage(String),
    PullImage(String),
    CreateContainer {
        image: String,
        name: String,
        volumes: Vec<String>,
    },
    Exec {
        container: String,
        cmd: Vec<String>,
        env: Vec<String>,
    },
    Cat {
        container: String,
        dir: String,
        filename: String,
    },
    DestroyContainer {
        name: String,
    },
}

pub struct MockCloud {
    calls: Mutex<Vec<CloudCall>>,
    has_image: Mutex<bool>,
    cat_contents: Mutex<Result<String>>,
    fail_exec_containing: Mutex<Option<String>>,
    block_exec_containing: Mutex<Option<String>>,
    counter: AtomicU64,
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            has_image: Mutex::new(true),
            cat_contents: Mutex::new(Ok(String::new())),
            fail_exec_containing: Mutex::new(None),
            block_exec_containing: Mutex::new(None),
            counter: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_has_image(&self, present: bool) {
        *self.has_image.lock().unwrap() = present;
    }

    pub fn set_cat_contents(&self, contents: impl Into<String>) {
        *self.cat_contents.lock().unwrap() = Ok(contents.into());
    }

    pub fn set_cat_error(&self, message: impl Into<String>) {
        *self.cat_contents.lock().unwrap() = Err(Error::Cloud(message.into()));
    }

    /// Make `exec` fail when the joined argv contains the substring.
    pub fn fail_exec_containing(&self, needle: impl Into<String>) {
        *self.fail_exec_containing.lock().unwrap() = Some(needle.into());
    }

    /// Make `exec` hang forever when the joined argv contains the
    /// substring, until the caller's cancellation drops the future.
    pub fn block_exec_containing(&self, needle: impl Into<String>) {
        *self.block_exec_containing.lock().unwrap() = Some(needle.into());
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                CloudCall::DestroyContainer { name } => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn created(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                CloudCall::CreateContainer { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Cloud for MockCloud {
    async fn cleanup(&self) -> Result<()> {
        self.calls.lock().unwrap().push(CloudCall::Cleanup);
        Ok(())
    }

    async fn has_image(&self, reference: &str) -> Result<bool> {
        self.calls
            .lock()
            .unwrap()
            .push(CloudCall::HasImage(reference.to_string()));
        Ok(*self.has_image.lock().unwrap())
    }

    async fn pull_image(&self, reference: &str, _sink: &dyn LogSink) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(CloudCall::PullImage(reference.to_string()));
        Ok(())
    }

    async fn create_container(
        &self,
        image: &str,
        name: &str,
        volumes: &[String],
    ) -> Result<Container> {
        self.calls.lock().unwrap().push(CloudCall::CreateContainer {
            image: image.to_string(),
            name: name.to_string(),
            volumes: volumes.to_vec(),
        });

        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(Container {
            id: format!("container-{id}"),
            name: name.to_string(),
        })
    }

    async fn exec(
        &self,
        container: &Container,
        config: ExecConfig,
        _sink: &dyn LogSink,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(CloudCall::Exec {
            container: container.name.clone(),
            cmd: config.cmd.clone(),
            env: config.env.clone(),
        });

        let joined = config.cmd.join(" ");

        let blocks = self
            .block_exec_containing
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|needle| joined.contains(needle));
        if blocks {
            std::future::pending::<()>().await;
        }

        let fails = self
            .fail_exec_containing
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|needle| joined.contains(needle));
        if fails {
            return Err(Error::ExecutionFailed(format!(
                "command {:?} exited with code 1",
                config.cmd
            )));
        }

        Ok(())
    }

    async fn cat(&self, container: &Container, dir: &str, filename: &str) -> Result<String> {
        self.calls.lock().unwrap().push(CloudCall::Cat {
            container: container.name.clone(),
            dir: dir.to_string(),
            filename: filename.to_string(),
        });

        match &*self.cat_contents.lock().unwrap() {
            Ok(contents) => Ok(contents.clone()),
            Err(err) => Err(Error::Cloud(err.to_string())),
        }
    }

    async fn destroy_container(&self, container: &Container) -> Result<()> {
        self.calls.lock().unwrap().push(CloudCall::DestroyContainer {
            name: container.name.clone(),
        });
        Ok(())
    }
}

/// Sink that swallows everything.
pub struct NullSink;

#[async_trait]
impl LogSink for NullSink {
    async fn output(&self, _chunk: &str) {}
}

/// A runner configuration usable in tests without touching the
/// filesystem.
pub fn runner_config() -> snake_config::RunnerConfig {
    snake_config::RunnerConfig {
        master_address: "http://ci.example.com".to_string(),
        access_token: String::new(),
        name: "test-runner".to_string(),
        max_parallel_pipelines: 4,
        scheduler_interval_secs: 1,
        pipelines_dir: "/pipelines-dir".into(),
        docker: snake_config::DockerConfig::default(),
    }
}

/// Poll a condition until it holds. The generous timeout leaves room for
/// real RSA generation in unoptimized builds.
pub async fn wait_until(predicate: impl Fn() -> bool) {
    for _ in 0..6000 {
        if predicate() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 60s");
}
