//! Local Docker implementation of the container provider.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use snake_core::cloud::{Cloud, Container, ExecConfig, LogSink};
use snake_core::{Error, Result};

/// Label attached to every container this runner creates; startup cleanup
/// prunes by it.
pub const RUNNER_LABEL: &str = "io.snake-runner.owned";

/// Sidecar and job containers idle on this command; work happens through
/// `exec`, so a container survives between commands.
const IDLE_COMMAND: &str = "while :; do sleep 86400; done";

/// Container provider backed by the local Docker daemon.
pub struct DockerCloud {
    docker: Docker,
    network: Option<String>,
    volumes: Vec<String>,
}

impl DockerCloud {
    /// Connect to the local Docker daemon.
    pub fn new(network: Option<String>, volumes: Vec<String>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|err| Error::Cloud(err.to_string()))?;
        Ok(Self {
            docker,
            network,
            volumes,
        })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker, network: Option<String>, volumes: Vec<String>) -> Self {
        Self {
            docker,
            network,
            volumes,
        }
    }
}

#[async_trait]
impl Cloud for DockerCloud {
    async fn cleanup(&self) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![RUNNER_LABEL.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|err| Error::Cloud(format!("unable to list containers: {err}")))?;

        for container in containers {
            let Some(id) = container.id else { continue };
            info!(container = %id, "Removing orphaned runner container");
            self.docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|err| {
                    Error::Cloud(format!("unable to remove container {id}: {err}"))
                })?;
        }

        Ok(())
    }

    async fn has_image(&self, reference: &str) -> Result<bool> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(err) => Err(Error::Cloud(format!(
                "unable to inspect image {reference}: {err}"
            ))),
        }
    }

    async fn pull_image(&self, reference: &str, sink: &dyn LogSink) -> Result<()> {
        info!(image = %reference, "Pulling image");

        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(update) => {
                    if let Some(status) = update.status {
                        debug!(image = %reference, status = %status, "Pull progress");
                        sink.output(&format!("{status}\n")).await;
                    }
                }
                Err(err) => {
                    return Err(Error::Cloud(format!(
                        "unable to pull image {reference}: {err}"
                    )))
                }
            }
        }

        Ok(())
    }

    async fn create_container(
        &self,
        image: &str,
        name: &str,
        volumes: &[String],
    ) -> Result<Container> {
        let mut binds: Vec<String> = volumes.to_vec();
        binds.extend(self.volumes.iter().cloned());

        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                IDLE_COMMAND.to_string(),
            ]),
            labels: Some(HashMap::from([(
                RUNNER_LABEL.to_string(),
                "true".to_string(),
            )])),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(binds),
                network_mode: self.network.clone(),
                ..Default::default()
            }),
            ..Default::default()
        };

        info!(container = %name, image = %image, "Creating container");
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|err| Error::Cloud(format!("unable to create container {name}: {err}")))?;

        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| Error::Cloud(format!("unable to start container {name}: {err}")))?;

        Ok(Container {
            id: created.id,
            name: name.to_string(),
        })
    }

    async fn exec(
        &self,
        container: &Container,
        config: ExecConfig,
        sink: &dyn LogSink,
    ) -> Result<()> {
        let exec = self
            .docker
            .create_exec(
                &container.id,
                CreateExecOptions {
                    cmd: Some(config.cmd.clone()),
                    env: (!config.env.is_empty()).then(|| config.env.clone()),
                    attach_stdout: Some(config.attach_stdout),
                    attach_stderr: Some(config.attach_stderr),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| {
                Error::Cloud(format!(
                    "unable to create exec in {}: {err}",
                    container.name
                ))
            })?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|err| {
                Error::Cloud(format!("unable to start exec in {}: {err}", container.name))
            })?;

        if let StartExecResults::Attached { mut output, .. } = started {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => {
                        sink.output(&String::from_utf8_lossy(&message)).await;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(container = %container.name, error = %err, "Exec stream error");
                    }
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|err| Error::Cloud(format!("unable to inspect exec: {err}")))?;

        match inspect.exit_code {
            Some(0) | None => Ok(()),
            Some(code) => Err(Error::ExecutionFailed(format!(
                "command {:?} exited with code {code}",
                config.cmd
            ))),
        }
    }

    async fn cat(&self, container: &Container, dir: &str, filename: &str) -> Result<String> {
        let path = format!("{}/{}", dir.trim_end_matches('/'), filename);
        let collector = Collector::default();

        self.exec(
            container,
            ExecConfig::attached(vec!["cat".to_string(), path.clone()]),
            &collector,
        )
        .await
        .map_err(|err| Error::Cloud(format!("unable to read {path}: {err}")))?;

        Ok(collector.take())
    }

    async fn destroy_container(&self, container: &Container) -> Result<()> {
        self.docker
            .remove_container(
                &container.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| {
                Error::Cloud(format!(
                    "unable to remove container {}: {err}",
                    container.name
                ))
            })
    }
}

/// Sink that accumulates output in memory, for reads like `cat`.
#[derive(Default)]
struct Collector {
    buffer: std::sync::Mutex<String>,
}

impl Collector {
    fn take(&self) -> String {
        std::mem::take(&mut self.buffer.lock().expect("collector mutex poisoned"))
    }
}

#[async_trait]
impl LogSink for Collector {
    async fn output(&self, chunk: &str) {
        self.buffer
            .lock()
            .expect("collector mutex poisoned")
            .push_str(chunk);
    }
}
