//! Runner configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Configuration of the runner agent itself, loaded from a YAML file at
/// startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Base URL of the CI service.
    pub master_address: String,

    /// Token identifying this runner to the service.
    #[serde(default)]
    pub access_token: String,

    /// Display name the runner reports to the service.
    #[serde(default = "default_name")]
    pub name: String,

    /// Upper bound on concurrently running pipelines.
    #[serde(default = "default_max_parallel_pipelines")]
    pub max_parallel_pipelines: i64,

    /// Pause between polls when the service had nothing for us.
    #[serde(default = "default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,

    /// Host directory that holds per-pipeline workspaces.
    #[serde(default = "default_pipelines_dir")]
    pub pipelines_dir: PathBuf,

    #[serde(default)]
    pub docker: DockerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Network to attach sidecar and job containers to.
    #[serde(default)]
    pub network: Option<String>,

    /// Extra bind mounts for every job container.
    #[serde(default)]
    pub volumes: Vec<String>,
}

fn default_name() -> String {
    hostname().unwrap_or_else(|| "snake-runner".to_string())
}

fn default_max_parallel_pipelines() -> i64 {
    4
}

fn default_scheduler_interval_secs() -> u64 {
    5
}

fn default_pipelines_dir() -> PathBuf {
    PathBuf::from("/var/lib/snake-runner/pipelines")
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME").ok().filter(|name| !name.is_empty())
}

impl RunnerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.master_address.is_empty() {
            return Err(ConfigError::MissingField("master_address".to_string()));
        }

        if self.max_parallel_pipelines < 1 {
            return Err(ConfigError::InvalidValue {
                field: "max_parallel_pipelines".to_string(),
                message: format!("must be positive, got {}", self.max_parallel_pipelines),
            });
        }

        Ok(())
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }
}
