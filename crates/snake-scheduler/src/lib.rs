//! Task scheduling and pipeline execution for snake-runner.
//!
//! The scheduler polls the CI service for work, admits pipelines up to
//! the configured parallelism, and runs each granted pipeline as a
//! sequence of jobs in ephemeral containers sharing a sidecar-provisioned
//! workspace.

pub mod job;
pub mod keypool;
pub mod logs;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod sidecar;

#[cfg(test)]
pub(crate) mod testutil;

pub use pipeline::PipelineProcess;
pub use scheduler::Scheduler;
pub use sidecar::Sidecar;
