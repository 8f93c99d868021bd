//! Poll loop, admission control and pipeline lifecycle.
//!
//! The scheduler owns three long-lived workers: the SSH-key producer,
//! the poll loop and the utilization drain. Pipelines run as tracked
//! tasks on top of those, bounded by `max_parallel_pipelines`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use snake_config::RunnerConfig;
use snake_core::client::Client;
use snake_core::cloud::{Cloud, Container};
use snake_core::sshkey::{SshKey, DEFAULT_BIT_SIZE};
use snake_core::task::{PipelineRun, Task};
use snake_core::Result;

use crate::keypool::KeyPool;
use crate::pipeline::PipelineProcess;
use crate::registry::PipelineRegistry;

pub struct Scheduler {
    client: Arc<dyn Client>,
    cloud: Arc<dyn Cloud>,
    config: Arc<RunnerConfig>,

    /// Count of running pipelines, read by the poll loop for the
    /// admission bit and mutated by pipeline tasks.
    pipelines: AtomicI64,
    running: PipelineRegistry<()>,
    cancels: PipelineRegistry<CancellationToken>,

    /// Send side of the utilization channel. Taken (and thereby closed)
    /// during shutdown, after every pipeline has drained.
    utilization: Mutex<Option<mpsc::Sender<Container>>>,

    key_pool: KeyPool,
    /// Key cached between polls; a poll that consumed it (or saw the
    /// request fail) clears it.
    ssh_key: Mutex<Option<SshKey>>,
    token: CancellationToken,
    tracker: TaskTracker,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Construct the scheduler and spawn its workers.
    pub fn start(
        client: Arc<dyn Client>,
        cloud: Arc<dyn Cloud>,
        config: Arc<RunnerConfig>,
    ) -> Arc<Self> {
        let token = CancellationToken::new();
        let capacity = config.max_parallel_pipelines.max(1) as usize;

        let (key_pool, key_worker) = KeyPool::start(token.clone(), capacity, DEFAULT_BIT_SIZE);
        let (utilization_tx, utilization_rx) = mpsc::channel(capacity * 2);

        let scheduler = Arc::new(Self {
            client,
            cloud,
            config,
            pipelines: AtomicI64::new(0),
            running: PipelineRegistry::new(),
            cancels: PipelineRegistry::new(),
            utilization: Mutex::new(Some(utilization_tx)),
            key_pool,
            ssh_key: Mutex::new(None),
            token,
            tracker: TaskTracker::new(),
            workers: Mutex::new(Vec::new()),
        });

        let drain = tokio::spawn(utilize(scheduler.cloud.clone(), utilization_rx));
        let poll = tokio::spawn(scheduler.clone().poll_loop());

        *scheduler.workers() = vec![key_worker, poll, drain];

        info!("Task scheduler started");
        scheduler
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            if self.token.is_cancelled() {
                return;
            }

            let wait = match self.get_and_serve().await {
                Ok(wait) => wait,
                Err(err) => {
                    error!(error = %err, "Unable to get a task");
                    true
                }
            };

            if wait {
                debug!(
                    interval_secs = self.config.scheduler_interval_secs,
                    "Sleeping until the next poll"
                );
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = tokio::time::sleep(self.config.scheduler_interval()) => {}
                }
            }
        }
    }

    /// One poll: make sure a pre-generated key is at hand, present the
    /// running set and the admission bit to the service, dispatch
    /// whatever comes back. Returns whether the loop should sleep before
    /// the next poll.
    async fn get_and_serve(self: &Arc<Self>) -> Result<bool> {
        if self.cached_key().is_none() {
            tokio::select! {
                _ = self.token.cancelled() => return Ok(false),
                key = self.key_pool.recv() => match key {
                    Some(key) => self.set_cached_key(Some(key)),
                    None => return Ok(false),
                }
            }
        }

        let Some(key) = self.cached_key() else {
            return Ok(false);
        };

        let running = self.pipelines.load(Ordering::SeqCst);
        debug!(running, "Retrieving task");

        let has_capacity = running < self.config.max_parallel_pipelines;

        match self
            .client
            .get_task(self.running.keys(), has_capacity, &key)
            .await
        {
            Err(err) => {
                // the key accompanied a failed request; treat it as stale
                self.set_cached_key(None);
                Err(err)
            }
            Ok(None) => Ok(true),
            Ok(Some(task)) => {
                // consumed: the service registered it as a deploy key
                self.set_cached_key(None);
                self.serve_task(task, key);
                Ok(false)
            }
        }
    }

    fn serve_task(self: &Arc<Self>, task: Task, ssh_key: SshKey) {
        match task {
            Task::PipelineRun(run) => self.start_pipeline(run, ssh_key),
            Task::PipelineCancel(cancel) => {
                for id in cancel.pipelines {
                    self.cancel_pipeline(id);
                }
            }
        }
    }

    fn start_pipeline(self: &Arc<Self>, task: PipelineRun, ssh_key: SshKey) {
        let id = task.pipeline.id;

        let Some(utilization) = self.utilization().clone() else {
            warn!(pipeline = id, "Scheduler is shutting down, dropping pipeline task");
            return;
        };

        debug!(pipeline = id, "Starting pipeline");

        let pipeline_token = CancellationToken::new();
        self.pipelines.fetch_add(1, Ordering::SeqCst);
        self.running.store(id, ());
        self.cancels.store(id, pipeline_token.clone());

        let scheduler = self.clone();
        let _task = self.tracker.spawn(async move {
            let mut process = PipelineProcess::new(
                scheduler.token.clone(),
                pipeline_token,
                scheduler.client.clone(),
                scheduler.cloud.clone(),
                scheduler.config.clone(),
                task,
                utilization,
                ssh_key,
            );

            match process.run().await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {
                    info!(pipeline = id, "Pipeline finished due to cancel");
                }
                Err(err) => {
                    debug!(
                        pipeline = id,
                        error = %err,
                        "An error occurred during pipeline run"
                    );
                }
            }

            scheduler.pipelines.fetch_add(-1, Ordering::SeqCst);
            scheduler.running.remove(id);
            scheduler.cancels.remove(id);
        });
    }

    /// Cancel one pipeline. A missing handle means the pipeline finished
    /// naturally a moment earlier; that race is benign.
    pub fn cancel_pipeline(&self, id: i64) {
        match self.cancels.load(id) {
            None => {
                warn!(
                    pipeline = id,
                    "Unable to cancel pipeline, it has already finished"
                );
            }
            Some(token) => {
                info!(pipeline = id, "Canceling pipeline");
                token.cancel();
                self.cancels.remove(id);
                self.running.remove(id);
            }
        }
    }

    /// Graceful shutdown: stop polling, cancel every running pipeline,
    /// wait for them to drain, then close the utilization channel and
    /// join the workers. Container destruction survives this path.
    pub async fn shutdown(self: &Arc<Self>) {
        warn!("Shutdown: terminating scheduler routines");

        self.token.cancel();

        self.running.range(|id, _| {
            warn!(pipeline = id, "Shutdown: canceling pipeline");
            self.cancel_pipeline(id);
            true
        });

        let reporter = tokio::spawn({
            let scheduler = self.clone();
            async move {
                loop {
                    let remaining = scheduler.pipelines.load(Ordering::SeqCst);
                    if remaining == 0 {
                        break;
                    }
                    warn!(remaining, "Shutdown: waiting for pipelines to be terminated");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });

        self.tracker.close();
        self.tracker.wait().await;
        reporter.abort();

        warn!("Shutdown: waiting for all containers to be utilized");
        self.utilization().take();

        let workers = std::mem::take(&mut *self.workers());
        for worker in workers {
            let _ = worker.await;
        }

        warn!("Shutdown: scheduler gracefully terminated");
    }

    fn cached_key(&self) -> Option<SshKey> {
        self.ssh_key.lock().expect("ssh key mutex poisoned").clone()
    }

    fn set_cached_key(&self, key: Option<SshKey>) {
        *self.ssh_key.lock().expect("ssh key mutex poisoned") = key;
    }

    fn utilization(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<Container>>> {
        self.utilization
            .lock()
            .expect("utilization mutex poisoned")
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().expect("workers mutex poisoned")
    }
}

/// Drain of the utilization channel: destroy every container that
/// finished its work. Uses no cancellation so that destruction survives
/// scheduler shutdown; terminates when the channel closes.
async fn utilize(cloud: Arc<dyn Cloud>, mut containers: mpsc::Receiver<Container>) {
    while let Some(container) = containers.recv().await {
        if let Err(err) = cloud.destroy_container(&container).await {
            error!(
                id = %container.id,
                name = %container.name,
                error = %err,
                "Unable to utilize (destroy) container after a job"
            );
        } else {
            debug!(id = %container.id, name = %container.name, "Container utilized");
        }
    }
}
