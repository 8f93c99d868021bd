//! Core domain types and traits for the snake-runner CI agent.
//!
//! This crate contains:
//! - The task sum type delivered by the CI service
//! - Pipeline and job status vocabulary
//! - The `Client` trait (CI service) and `Cloud` trait (container provider)
//! - RSA deploy keys

pub mod client;
pub mod cloud;
pub mod error;
pub mod sshkey;
pub mod status;
pub mod task;

pub use client::Client;
pub use cloud::{Cloud, Container, ExecConfig, LogSink};
pub use error::{Error, Result};
pub use sshkey::SshKey;
pub use status::Status;
pub use task::{Job, PipelineCancel, PipelineRun, Task};
