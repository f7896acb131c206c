//! Docker engine client (bollard)

use super::{ContainerHandle, ContainerRuntime, ContainerState, RuntimeError};
use async_trait::async_trait;
use bollard::{
    errors::Error as BollardError,
    query_parameters::{
        InspectContainerOptions, ListContainersOptionsBuilder, RestartContainerOptionsBuilder,
        StartContainerOptions, StopContainerOptionsBuilder,
    },
    Docker, API_DEFAULT_VERSION,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

pub struct DockerRuntime {
    docker: Docker,
    endpoint: String,
}

impl DockerRuntime {
    /// `host` accepts `unix:///path/to/docker.sock` or an HTTP address; `None` uses
    /// the platform default socket.
    pub fn connect(host: Option<&str>, timeout_secs: u64) -> Result<Self, RuntimeError> {
        let (docker, endpoint) = match host {
            None => (Docker::connect_with_local_defaults(), "local".to_string()),
            Some(host) if host.starts_with("unix://") => (
                Docker::connect_with_socket(
                    host.trim_start_matches("unix://"),
                    timeout_secs,
                    API_DEFAULT_VERSION,
                ),
                host.to_string(),
            ),
            Some(host) => (
                Docker::connect_with_http(host, timeout_secs, API_DEFAULT_VERSION),
                host.to_string(),
            ),
        };

        let docker = docker.map_err(|e| RuntimeError::Unavailable(format!("{endpoint}: {e}")))?;
        Ok(Self { docker, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(format!("{}: {e}", self.endpoint)))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<ContainerHandle>, RuntimeError> {
        let filters = label_filter(key, value);
        let options = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&filters)
            .build();

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| operation_error("list_containers", &format!("{key}={value}"), e))?;

        Ok(containers
            .into_iter()
            .filter_map(|summary| {
                let id = summary.id?;
                let name = summary.names.and_then(|names| names.into_iter().next());
                Some(ContainerHandle { id, name })
            })
            .collect())
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(&handle.id, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => {
                debug!(container = %handle.display_name(), "container already running");
                Ok(())
            }
            Err(e) => Err(operation_error("start_container", &handle.id, e)),
        }
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptionsBuilder::new().t(grace_secs(grace)).build();
        match self.docker.stop_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => {
                debug!(container = %handle.display_name(), "container already stopped");
                Ok(())
            }
            Err(e) => Err(operation_error("stop_container", &handle.id, e)),
        }
    }

    async fn restart(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError> {
        let options = RestartContainerOptionsBuilder::new().t(grace_secs(grace)).build();
        self.docker
            .restart_container(&handle.id, Some(options))
            .await
            .map_err(|e| operation_error("restart_container", &handle.id, e))
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeError> {
        let details = self
            .docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| operation_error("inspect_container", &handle.id, e))?;

        let running = details
            .state
            .and_then(|state| state.running)
            .unwrap_or(false);
        Ok(ContainerState { running })
    }
}

fn label_filter(key: &str, value: &str) -> HashMap<&'static str, Vec<String>> {
    HashMap::from([("label", vec![format!("{key}={value}")])])
}

fn grace_secs(grace: Duration) -> i32 {
    i32::try_from(grace.as_secs()).unwrap_or(i32::MAX)
}

fn is_not_modified(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code: 304, .. }
    )
}

fn operation_error(operation: &'static str, target: &str, source: BollardError) -> RuntimeError {
    match source {
        BollardError::DockerResponseServerError { status_code: 404, .. } => {
            RuntimeError::NotFound(target.to_string())
        }
        BollardError::DockerResponseServerError { message, .. } => RuntimeError::Failed {
            operation,
            container: target.to_string(),
            message,
        },
        other => RuntimeError::Unavailable(format!("{operation}: {other}")),
    }
}
