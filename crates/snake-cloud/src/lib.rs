//! Container backends for snake-runner.
//!
//! Provides the Docker implementation of the [`snake_core::Cloud`] trait.

pub mod docker;

pub use docker::DockerCloud;
