//! Pipeline configuration parsing.
//!
//! The file is YAML with three recognised top-level keys: `image` and
//! `stages` are required, `variables` is optional. Every other top-level
//! key declares a job. The three recognised names are reserved: a job
//! cannot be called `image`, `stages` or `variables`.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;

use crate::error::{ConfigError, ConfigResult};

/// Parsed pipeline definition.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Default image for job containers.
    pub image: String,
    /// Stage names in execution order.
    pub stages: Vec<String>,
    /// Variables exported into every job's environment.
    pub variables: HashMap<String, String>,
    /// Job definitions keyed by name.
    pub jobs: HashMap<String, JobConfig>,
}

/// A single job definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub stage: String,
    /// Shell used to run each command. Defaults to `sh`.
    #[serde(default)]
    pub shell: Option<String>,
    /// Image override for this job only.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    /// Variables merged over the pipeline-level ones.
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

/// Parse a pipeline configuration from YAML text.
pub fn parse_pipeline(contents: &str) -> ConfigResult<PipelineConfig> {
    let mut raw: Mapping = serde_yaml::from_str(contents)?;

    let image: String = take_field(&mut raw, "image")?;
    let stages: Vec<String> = take_field(&mut raw, "stages")?;

    let variables: HashMap<String, String> = match raw.remove("variables") {
        Some(value) => decode_field("variables", value)?,
        None => HashMap::new(),
    };

    let mut jobs = HashMap::new();
    for (key, value) in raw {
        let name = match key.as_str() {
            Some(name) => name.to_string(),
            None => {
                return Err(ConfigError::InvalidValue {
                    field: format!("{:?}", key),
                    message: "job names must be strings".to_string(),
                })
            }
        };

        let job: JobConfig =
            serde_yaml::from_value(value).map_err(|err| ConfigError::InvalidJob {
                name: name.clone(),
                message: err.to_string(),
            })?;

        jobs.insert(name, job);
    }

    Ok(PipelineConfig {
        image,
        stages,
        variables,
        jobs,
    })
}

fn take_field<T: for<'de> Deserialize<'de>>(raw: &mut Mapping, field: &str) -> ConfigResult<T> {
    match raw.remove(field) {
        None => Err(ConfigError::MissingField(field.to_string())),
        Some(value) => decode_field(field, value),
    }
}

fn decode_field<T: for<'de> Deserialize<'de>>(field: &str, value: Value) -> ConfigResult<T> {
    serde_yaml::from_value(value).map_err(|err| ConfigError::InvalidValue {
        field: field.to_string(),
        message: err.to_string(),
    })
}
