//! Lifecycle state machine
//!
//! Turns one lifecycle command into at most one container operation and at most
//! one status event:
//!
//! | command | container lookup | runtime action   | status event |
//! |---------|------------------|------------------|--------------|
//! | start   | zero or one      | start if present | `online`     |
//! | stop    | exactly one      | stop with grace  | `offline`    |
//! | restart | exactly one      | restart w/ grace | `online`     |
//! | backup  | exactly one      | none             | none         |
//!
//! Commands for servers on other nodes are ignored. Lookup problems and runtime
//! failures abandon the command without a status event, so the kernel keeps
//! whatever status it set optimistically.

use crate::directory::{DirectoryError, NodeId, ServerDirectory};
use crate::runtime::{ContainerHandle, ContainerRuntime, RuntimeError};
use raptor_bus::{BusError, CommandAction, LifecycleCommand, MessageBus, ServerStatus, StatusEvent};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What handling one command amounted to.
#[derive(Debug)]
pub enum Outcome {
    /// The server does not live on this node.
    Ignored,
    /// The status event was published.
    Reported(StatusEvent),
    /// Accepted with nothing to report (backup).
    Acknowledged,
    /// Given up; nothing was published.
    Abandoned(AbandonReason),
}

#[derive(Debug)]
pub enum AbandonReason {
    Directory(DirectoryError),
    NoContainer,
    AmbiguousContainer(usize),
    Runtime(RuntimeError),
    /// The container operation succeeded but the status event could not be sent.
    Publish(BusError),
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbandonReason::Directory(e) => write!(f, "ownership lookup failed: {e}"),
            AbandonReason::NoContainer => f.write_str("no container carries the server label"),
            AbandonReason::AmbiguousContainer(n) => write!(f, "{n} containers carry the server label"),
            AbandonReason::Runtime(e) => write!(f, "{e}"),
            AbandonReason::Publish(e) => write!(f, "status publish failed: {e}"),
        }
    }
}

impl Outcome {
    pub fn status(&self) -> Option<ServerStatus> {
        match self {
            Outcome::Reported(event) => Some(event.status),
            _ => None,
        }
    }
}

/// Per-node executor shared by every in-flight command.
pub struct LifecycleExecutor {
    node_id: NodeId,
    runtime: Arc<dyn ContainerRuntime>,
    directory: Arc<dyn ServerDirectory>,
    bus: Arc<dyn MessageBus>,
    label_key: String,
    grace_period: Duration,
}

impl LifecycleExecutor {
    pub fn new(
        node_id: NodeId,
        runtime: Arc<dyn ContainerRuntime>,
        directory: Arc<dyn ServerDirectory>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            node_id,
            runtime,
            directory,
            bus,
            label_key: "server.id".to_string(),
            grace_period: Duration::from_secs(10),
        }
    }

    pub fn with_label_key(mut self, label_key: impl Into<String>) -> Self {
        self.label_key = label_key.into();
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub async fn execute(&self, command: LifecycleCommand) -> Outcome {
        let started = Instant::now();
        let outcome = self.run(command).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Outcome::Ignored => {
                debug!(server_id = command.server_id, action = %command.action, "not hosted on this node")
            }
            Outcome::Reported(event) => info!(
                server_id = command.server_id,
                action = %command.action,
                status = %event.status,
                elapsed_ms,
                "lifecycle command completed"
            ),
            Outcome::Acknowledged => info!(
                server_id = command.server_id,
                action = %command.action,
                "lifecycle command acknowledged"
            ),
            Outcome::Abandoned(reason) => warn!(
                server_id = command.server_id,
                action = %command.action,
                elapsed_ms,
                "lifecycle command abandoned: {reason}"
            ),
        }
        outcome
    }

    async fn run(&self, command: LifecycleCommand) -> Outcome {
        match self.directory.node_of(command.server_id).await {
            Ok(Some(node_id)) if node_id == self.node_id => {}
            Ok(_) => return Outcome::Ignored,
            Err(e) => return Outcome::Abandoned(AbandonReason::Directory(e)),
        }

        let label_value = command.server_id.to_string();
        let containers = match self.runtime.list_by_label(&self.label_key, &label_value).await {
            Ok(containers) => containers,
            Err(e) => return Outcome::Abandoned(AbandonReason::Runtime(e)),
        };

        let result = match (command.action, containers.as_slice()) {
            (_, [_, _, ..]) => Err(AbandonReason::AmbiguousContainer(containers.len())),
            (CommandAction::Start, []) => {
                info!(
                    server_id = command.server_id,
                    "no container for server, container creation is not supported; reporting online"
                );
                Ok(Some(ServerStatus::Online))
            }
            (_, []) => Err(AbandonReason::NoContainer),
            (CommandAction::Start, [handle]) => self.start(handle).await.map(|_| Some(ServerStatus::Online)),
            (CommandAction::Stop, [handle]) => self
                .runtime
                .stop(handle, self.grace_period)
                .await
                .map(|_| Some(ServerStatus::Offline))
                .map_err(AbandonReason::Runtime),
            (CommandAction::Restart, [handle]) => self
                .runtime
                .restart(handle, self.grace_period)
                .await
                .map(|_| Some(ServerStatus::Online))
                .map_err(AbandonReason::Runtime),
            (CommandAction::Backup, [handle]) => {
                info!(
                    server_id = command.server_id,
                    container = %handle.display_name(),
                    "backup requested; capture is handled outside the agent"
                );
                Ok(None)
            }
        };

        match result {
            Ok(Some(status)) => self.report(StatusEvent::new(command.server_id, status)).await,
            Ok(None) => Outcome::Acknowledged,
            Err(reason) => Outcome::Abandoned(reason),
        }
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), AbandonReason> {
        let state = self
            .runtime
            .inspect(handle)
            .await
            .map_err(AbandonReason::Runtime)?;
        if state.running {
            debug!(container = %handle.display_name(), "container already running");
            return Ok(());
        }
        self.runtime.start(handle).await.map_err(AbandonReason::Runtime)
    }

    async fn report(&self, event: StatusEvent) -> Outcome {
        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(e) => return Outcome::Abandoned(AbandonReason::Publish(e)),
        };
        match self.bus.publish(event.topic(), payload).await {
            Ok(()) => Outcome::Reported(event),
            Err(e) => Outcome::Abandoned(AbandonReason::Publish(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::runtime::mock::{MockRuntime, RuntimeCall};
    use raptor_devkit::RecordingBus;

    const NODE: NodeId = 1;

    fn executor(runtime: Arc<MockRuntime>, bus: RecordingBus, servers: &[u64]) -> LifecycleExecutor {
        let directory = Arc::new(StaticDirectory::new(NODE, servers.iter().copied()));
        LifecycleExecutor::new(NODE, runtime, directory, Arc::new(bus))
    }

    #[tokio::test]
    async fn test_start_reports_exactly_one_online_event() {
        let runtime = Arc::new(MockRuntime::new().with_container("c7", "server.id", "7", false));
        let bus = RecordingBus::new();
        let executor = executor(runtime.clone(), bus.clone(), &[7]);

        let outcome = executor.execute(LifecycleCommand::new(7, CommandAction::Start)).await;

        assert_eq!(outcome.status(), Some(ServerStatus::Online));
        assert_eq!(bus.status_events(), vec![StatusEvent::new(7, ServerStatus::Online)]);
        assert_eq!(runtime.is_running("c7"), Some(true));
    }

    #[tokio::test]
    async fn test_start_skips_running_container() {
        let runtime = Arc::new(MockRuntime::new().with_container("c7", "server.id", "7", true));
        let bus = RecordingBus::new();
        let executor = executor(runtime.clone(), bus.clone(), &[7]);

        executor.execute(LifecycleCommand::new(7, CommandAction::Start)).await;

        assert!(!runtime.calls().contains(&RuntimeCall::Start("c7".into())));
        assert_eq!(bus.status_events().len(), 1);
    }

    #[tokio::test]
    async fn test_start_without_container_still_reports_online() {
        let runtime = Arc::new(MockRuntime::new());
        let bus = RecordingBus::new();
        let executor = executor(runtime, bus.clone(), &[7]);

        let outcome = executor.execute(LifecycleCommand::new(7, CommandAction::Start)).await;

        assert_eq!(outcome.status(), Some(ServerStatus::Online));
        assert_eq!(bus.status_events(), vec![StatusEvent::new(7, ServerStatus::Online)]);
    }

    // Known limitation: a missing container is not reported back, so the
    // kernel keeps its optimistic "stopping".
    #[tokio::test]
    async fn test_stop_without_container_emits_nothing() {
        let runtime = Arc::new(MockRuntime::new());
        let bus = RecordingBus::new();
        let executor = executor(runtime, bus.clone(), &[42]);

        let outcome = executor.execute(LifecycleCommand::new(42, CommandAction::Stop)).await;

        assert!(matches!(outcome, Outcome::Abandoned(AbandonReason::NoContainer)));
        assert!(bus.get_published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_restart_use_grace_period() {
        let runtime = Arc::new(MockRuntime::new().with_container("c3", "server.id", "3", true));
        let bus = RecordingBus::new();
        let executor = executor(runtime.clone(), bus.clone(), &[3]).with_grace_period(Duration::from_secs(4));

        executor.execute(LifecycleCommand::new(3, CommandAction::Stop)).await;
        executor.execute(LifecycleCommand::new(3, CommandAction::Restart)).await;

        let calls = runtime.calls();
        assert!(calls.contains(&RuntimeCall::Stop("c3".into(), Duration::from_secs(4))));
        assert!(calls.contains(&RuntimeCall::Restart("c3".into(), Duration::from_secs(4))));
        assert_eq!(
            bus.status_events(),
            vec![
                StatusEvent::new(3, ServerStatus::Offline),
                StatusEvent::new(3, ServerStatus::Online)
            ]
        );
    }

    #[tokio::test]
    async fn test_ambiguous_lookup_is_abandoned() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_container("a", "server.id", "5", false)
                .with_container("b", "server.id", "5", false),
        );
        let bus = RecordingBus::new();
        let executor = executor(runtime.clone(), bus.clone(), &[5]);

        let outcome = executor.execute(LifecycleCommand::new(5, CommandAction::Start)).await;

        assert!(matches!(outcome, Outcome::Abandoned(AbandonReason::AmbiguousContainer(2))));
        assert!(bus.status_events().is_empty());
        assert_eq!(runtime.is_running("a"), Some(false));
    }

    #[tokio::test]
    async fn test_runtime_failure_emits_nothing() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_container("c9", "server.id", "9", true)
                .failing_on("c9"),
        );
        let bus = RecordingBus::new();
        let executor = executor(runtime, bus.clone(), &[9]);

        let outcome = executor.execute(LifecycleCommand::new(9, CommandAction::Restart)).await;

        assert!(matches!(outcome, Outcome::Abandoned(AbandonReason::Runtime(_))));
        assert!(bus.status_events().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_runtime_abandons_without_event() {
        let runtime = Arc::new(MockRuntime::new().with_container("c6", "server.id", "6", true));
        runtime.set_unavailable(true);
        let bus = RecordingBus::new();
        let executor = executor(runtime.clone(), bus.clone(), &[6]);

        let outcome = executor.execute(LifecycleCommand::new(6, CommandAction::Stop)).await;

        assert!(matches!(
            outcome,
            Outcome::Abandoned(AbandonReason::Runtime(RuntimeError::Unavailable(_)))
        ));
        assert!(bus.get_published_messages().is_empty());
        assert_eq!(runtime.is_running("c6"), Some(true));

        runtime.set_unavailable(false);
        let outcome = executor.execute(LifecycleCommand::new(6, CommandAction::Stop)).await;
        assert_eq!(outcome.status(), Some(ServerStatus::Offline));
    }

    #[tokio::test]
    async fn test_foreign_server_is_ignored() {
        let runtime = Arc::new(MockRuntime::new().with_container("c8", "server.id", "8", false));
        let bus = RecordingBus::new();
        let executor = executor(runtime.clone(), bus.clone(), &[7]);

        let outcome = executor.execute(LifecycleCommand::new(8, CommandAction::Start)).await;

        assert!(matches!(outcome, Outcome::Ignored));
        assert!(runtime.calls().is_empty());
        assert!(bus.get_published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_backup_is_acknowledged_without_event() {
        let runtime = Arc::new(MockRuntime::new().with_container("c2", "server.id", "2", true));
        let bus = RecordingBus::new();
        let executor = executor(runtime, bus.clone(), &[2]);

        let outcome = executor.execute(LifecycleCommand::new(2, CommandAction::Backup)).await;

        assert!(matches!(outcome, Outcome::Acknowledged));
        assert!(bus.get_published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported_as_abandoned() {
        let runtime = Arc::new(MockRuntime::new().with_container("c1", "server.id", "1", false));
        let bus = RecordingBus::new();
        bus.set_failing(true);
        let executor = executor(runtime.clone(), bus, &[1]);

        let outcome = executor.execute(LifecycleCommand::new(1, CommandAction::Start)).await;

        assert!(matches!(outcome, Outcome::Abandoned(AbandonReason::Publish(_))));
        assert_eq!(runtime.is_running("c1"), Some(true));
    }
}
