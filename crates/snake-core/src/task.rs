//! Tasks delivered by the CI service.

use serde::{Deserialize, Serialize};

/// A unit of work granted to the runner. The service tags the variant on
/// the wire, so dispatch happens on construction rather than by
/// downcasting an opaque value at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    PipelineRun(PipelineRun),
    PipelineCancel(PipelineCancel),
}

/// A grant to execute one pipeline: the pipeline itself, the repository
/// it belongs to, and its jobs in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub pipeline: Pipeline,
    pub project: Project,
    pub repository: Repository,
    pub clone_url: CloneUrl,
    pub jobs: Vec<Job>,
}

/// A request to cancel pipelines this runner is currently executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCancel {
    pub pipelines: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    /// Commitish to check out after cloning.
    pub commit: String,
    /// Name of the pipeline config file inside the repository.
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneUrl {
    pub ssh: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    /// Name of the job definition in the pipeline config file.
    pub name: String,
    #[serde(default)]
    pub stage: String,
}
