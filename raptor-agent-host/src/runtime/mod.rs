//! Container runtime client
//!
//! Thin facade over the host's container engine. It holds no state of its own
//! beyond the engine connection and must be safe to share between concurrent
//! lifecycle operations.

pub mod docker;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use docker::DockerRuntime;

/// Opaque reference to one container on this host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub id: String,
    pub name: Option<String>,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    /// Name for log lines, falling back to the short id.
    pub fn display_name(&self) -> &str {
        match &self.name {
            Some(name) => name.trim_start_matches('/'),
            None => self.id.get(..12).unwrap_or(&self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("container {0} not found")]
    NotFound(String),

    #[error("{operation} failed on {container}: {message}")]
    Failed {
        operation: &'static str,
        container: String,
        message: String,
    },
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Every container (running or not) carrying label `key=value`.
    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<ContainerHandle>, RuntimeError>;

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Stops the container, killing it once `grace` has elapsed.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError>;

    async fn restart(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError>;

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeError>;
}
