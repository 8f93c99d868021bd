//! Container provider trait and types.
//!
//! The provider runs sidecar and job containers in isolated environments
//! and is consumed strictly through this trait; the Docker implementation
//! lives in the `snake-cloud` crate.

use async_trait::async_trait;

use crate::Result;

/// Opaque handle to a container created by a [`Cloud`] provider.
#[derive(Debug, Clone)]
pub struct Container {
    pub id: String,
    pub name: String,
}

/// Configuration for a single exec inside a running container.
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    /// Argv of the command to run.
    pub cmd: Vec<String>,
    /// `KEY=value` pairs. Values injected here never appear in the argv
    /// of the executed command.
    pub env: Vec<String>,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

impl ExecConfig {
    /// An exec with both output streams attached and no environment.
    pub fn attached(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            env: Vec::new(),
            attach_stdout: true,
            attach_stderr: true,
        }
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }
}

/// Sink for output produced inside containers.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Forward a chunk of process output.
    async fn output(&self, chunk: &str);

    /// Announce a command before its output starts.
    async fn command(&self, cmd: &[String]) {
        self.output(&format!("\n$ {}\n", cmd.join(" "))).await;
    }
}

/// Trait for container providers.
#[async_trait]
pub trait Cloud: Send + Sync {
    /// One-shot prune of containers left behind by previous runner
    /// processes.
    async fn cleanup(&self) -> Result<()>;

    /// Whether the image is already present locally.
    async fn has_image(&self, reference: &str) -> Result<bool>;

    /// Pull an image, forwarding progress to the sink.
    async fn pull_image(&self, reference: &str, sink: &dyn LogSink) -> Result<()>;

    /// Create and start a container with the given bind mounts.
    async fn create_container(
        &self,
        image: &str,
        name: &str,
        volumes: &[String],
    ) -> Result<Container>;

    /// Run a command inside a container, streaming output to the sink.
    /// A non-zero exit code is an `Error::ExecutionFailed`.
    async fn exec(
        &self,
        container: &Container,
        config: ExecConfig,
        sink: &dyn LogSink,
    ) -> Result<()>;

    /// Read a file from a directory inside the container.
    async fn cat(&self, container: &Container, dir: &str, filename: &str) -> Result<String>;

    /// Force-remove a container.
    async fn destroy_container(&self, container: &Container) -> Result<()>;
}
