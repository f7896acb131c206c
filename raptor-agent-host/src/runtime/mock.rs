//! Scriptable in-memory runtime for tests.

use super::{ContainerHandle, ContainerRuntime, ContainerState, RuntimeError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    List { key: String, value: String },
    Start(String),
    Stop(String, Duration),
    Restart(String, Duration),
    Inspect(String),
}

#[derive(Debug, Clone)]
struct MockContainer {
    handle: ContainerHandle,
    labels: HashMap<String, String>,
    running: bool,
    delay: Duration,
}

#[derive(Default)]
struct MockState {
    containers: Vec<MockContainer>,
    calls: Vec<RuntimeCall>,
    unavailable: bool,
    failing: Vec<String>,
}

#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a container labelled `label_key=server_id`.
    pub fn with_container(self, id: &str, label_key: &str, server_id: &str, running: bool) -> Self {
        self.state.lock().containers.push(MockContainer {
            handle: ContainerHandle::new(id),
            labels: HashMap::from([(label_key.to_string(), server_id.to_string())]),
            running,
            delay: Duration::ZERO,
        });
        self
    }

    /// Every operation on container `id` sleeps for `delay` first.
    pub fn with_delay(self, id: &str, delay: Duration) -> Self {
        for container in self.state.lock().containers.iter_mut() {
            if container.handle.id == id {
                container.delay = delay;
            }
        }
        self
    }

    /// Start/stop/restart on container `id` fail with `RuntimeError::Failed`.
    pub fn failing_on(self, id: &str) -> Self {
        self.state.lock().failing.push(id.to_string());
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.lock().calls.clone()
    }

    pub fn is_running(&self, id: &str) -> Option<bool> {
        self.state
            .lock()
            .containers
            .iter()
            .find(|c| c.handle.id == id)
            .map(|c| c.running)
    }

    fn record(&self, call: RuntimeCall) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.unavailable {
            return Err(RuntimeError::Unavailable("mock runtime offline".into()));
        }
        Ok(())
    }

    fn delay_for(&self, id: &str) -> Duration {
        self.state
            .lock()
            .containers
            .iter()
            .find(|c| c.handle.id == id)
            .map(|c| c.delay)
            .unwrap_or_default()
    }

    /// Applies `running` to container `id` after its configured delay.
    async fn transition(&self, operation: &'static str, id: &str, running: bool) -> Result<(), RuntimeError> {
        let delay = self.delay_for(id);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.failing.iter().any(|f| f == id) {
            return Err(RuntimeError::Failed {
                operation,
                container: id.to_string(),
                message: "scripted failure".into(),
            });
        }
        match state.containers.iter_mut().find(|c| c.handle.id == id) {
            Some(container) => {
                container.running = running;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_by_label(&self, key: &str, value: &str) -> Result<Vec<ContainerHandle>, RuntimeError> {
        self.record(RuntimeCall::List {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        Ok(self
            .state
            .lock()
            .containers
            .iter()
            .filter(|c| c.labels.get(key).map(String::as_str) == Some(value))
            .map(|c| c.handle.clone())
            .collect())
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Start(handle.id.clone()))?;
        self.transition("start", &handle.id, true).await
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Stop(handle.id.clone(), grace))?;
        self.transition("stop", &handle.id, false).await
    }

    async fn restart(&self, handle: &ContainerHandle, grace: Duration) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::Restart(handle.id.clone(), grace))?;
        self.transition("restart", &handle.id, true).await
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<ContainerState, RuntimeError> {
        self.record(RuntimeCall::Inspect(handle.id.clone()))?;
        self.state
            .lock()
            .containers
            .iter()
            .find(|c| c.handle.id == handle.id)
            .map(|c| ContainerState { running: c.running })
            .ok_or_else(|| RuntimeError::NotFound(handle.id.clone()))
    }
}
