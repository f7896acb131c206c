/**
 * CONTROL SURFACE - user intents to bus commands
 *
 * ROLE: checks ownership, advances the server's recorded status before the
 * agent confirms anything, tells the server's viewers, then publishes the
 * command. A failed publish puts the previous status back, unless another
 * write (an agent's status event) got there first.
 *
 * KNOWN GAP: nothing reconciles the optimistic status when an agent abandons
 * a command (no container, runtime failure). The status stays where this
 * module left it until the next authoritative event.
 */

use crate::hub::Hub;
use crate::models::{NewServer, Server, ServerId, ServerStatus, StatusNotice, UserId};
use crate::publisher::CommandPublisher;
use crate::store::{RecordStore, StoreError};
use raptor_bus::{BusError, CommandAction};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ControlError {
    /// Missing, or owned by someone else.
    #[error("server {0} not found")]
    NotFound(ServerId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("command bus unavailable")]
    BusUnavailable(#[source] BusError),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub server_id: ServerId,
    pub action: CommandAction,
    pub status: ServerStatus,
}

/// Status recorded as soon as the command is accepted.
pub fn optimistic_status(action: CommandAction, current: ServerStatus) -> ServerStatus {
    match action {
        CommandAction::Start => ServerStatus::Starting,
        CommandAction::Stop | CommandAction::Restart => ServerStatus::Stopping,
        CommandAction::Backup => current,
    }
}

#[derive(Clone)]
pub struct ControlSurface {
    store: Arc<dyn RecordStore>,
    publisher: CommandPublisher,
    hub: Hub,
}

impl ControlSurface {
    pub fn new(store: Arc<dyn RecordStore>, publisher: CommandPublisher, hub: Hub) -> Self {
        Self { store, publisher, hub }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn servers(&self, owner: UserId) -> Vec<Server> {
        self.store.servers_owned_by(owner)
    }

    pub fn server(&self, owner: UserId, id: ServerId) -> Result<Server, ControlError> {
        self.store.owned_server(id, owner).ok_or(ControlError::NotFound(id))
    }

    pub fn create_server(&self, owner: UserId, request: NewServer) -> Result<Server, ControlError> {
        Ok(self.store.create_server(owner, request)?)
    }

    pub fn delete_server(&self, owner: UserId, id: ServerId) -> Result<Server, ControlError> {
        self.server(owner, id)?;
        Ok(self.store.delete_server(id)?)
    }

    /// Viewers of a server see every status the kernel records for it, in order.
    async fn push_status(&self, server: &Server) {
        let notice = StatusNotice::new(server.id, server.status);
        if let Err(e) = self.hub.broadcast_to_server(&server.room(), &notice).await {
            warn!(server_id = server.id, "status push skipped: {e}");
        }
    }

    pub async fn dispatch(
        &self,
        owner: UserId,
        id: ServerId,
        action: CommandAction,
    ) -> Result<DispatchReceipt, ControlError> {
        let previous = self.server(owner, id)?.status;
        let next = optimistic_status(action, previous);

        if next != previous {
            let updated = self.store.set_status(id, next)?;
            self.push_status(&updated).await;
        }

        if let Err(e) = self.publisher.publish(id, action).await {
            if next != previous {
                match self.store.set_status_if(id, next, previous) {
                    Ok(Some(restored)) => self.push_status(&restored).await,
                    Ok(None) => debug!(server_id = id, "status moved on during publish, not restoring"),
                    Err(restore) => error!(server_id = id, "failed to restore status after publish failure: {restore}"),
                }
            }
            return Err(ControlError::BusUnavailable(e));
        }

        info!(server_id = id, %action, status = %next, "command dispatched");
        Ok(DispatchReceipt {
            server_id: id,
            action,
            status: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AllocationSeed, HubConfig, NodeSeed};
    use crate::store::FileStore;
    use raptor_devkit::{RecordingBus, BusFixtures};
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        control: ControlSurface,
        bus: RecordingBus,
        hub: Hub,
        _shutdown: tokio_util::sync::DropGuard,
    }

    fn seeded_store() -> Arc<FileStore> {
        let store = Arc::new(FileStore::in_memory());
        store.seed_nodes(&[NodeSeed {
            name: "node-1".into(),
            hostname: "node1".into(),
            ip: "10.0.0.1".into(),
            port: 8080,
            total_ram: 0,
            total_cpu: 0,
            total_disk: 0,
            allocations: vec![AllocationSeed {
                ip: "10.0.0.1".into(),
                ports: vec![25565, 25566],
            }],
        }]);
        store
    }

    fn fixture() -> Fixture {
        let store = seeded_store();
        let bus = RecordingBus::new();
        let shutdown = CancellationToken::new();
        let (hub, _task) = Hub::spawn(&HubConfig::default(), shutdown.clone());
        let control = ControlSurface::new(store, CommandPublisher::new(Arc::new(bus.clone())), hub.clone());
        Fixture {
            control,
            bus,
            hub,
            _shutdown: shutdown.drop_guard(),
        }
    }

    fn new_server() -> NewServer {
        NewServer {
            name: "mc".into(),
            node_id: 1,
            image: "itzg/minecraft-server".into(),
            limits: Default::default(),
        }
    }

    #[test]
    fn test_optimistic_status_table() {
        use CommandAction::*;
        assert_eq!(optimistic_status(Start, ServerStatus::Offline), ServerStatus::Starting);
        assert_eq!(optimistic_status(Stop, ServerStatus::Online), ServerStatus::Stopping);
        assert_eq!(optimistic_status(Restart, ServerStatus::Online), ServerStatus::Stopping);
        assert_eq!(optimistic_status(Backup, ServerStatus::Online), ServerStatus::Online);
    }

    #[tokio::test]
    async fn test_dispatch_publishes_and_pushes_to_viewers() {
        let f = fixture();
        let server = f.control.create_server(7, new_server()).unwrap();
        let (tx, mut rx) = f.hub.outbound_queue();
        let viewer = f.hub.register(tx).await.unwrap();
        f.hub.set_affinity(viewer, server.room()).await.unwrap();

        let receipt = f.control.dispatch(7, server.id, CommandAction::Start).await.unwrap();

        assert_eq!(receipt.status, ServerStatus::Starting);
        assert_eq!(f.bus.commands(), vec![raptor_bus::LifecycleCommand::new(server.id, CommandAction::Start)]);
        assert_eq!(f.control.server(7, server.id).unwrap().status, ServerStatus::Starting);

        let frame: StatusNotice = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame, StatusNotice::new(server.id, ServerStatus::Starting));
    }

    #[tokio::test]
    async fn test_foreign_owner_sees_not_found_and_nothing_is_published() {
        let f = fixture();
        let server = f.control.create_server(7, new_server()).unwrap();

        let err = f.control.dispatch(8, server.id, CommandAction::Stop).await.unwrap_err();

        assert!(matches!(err, ControlError::NotFound(id) if id == server.id));
        assert!(f.bus.get_published_messages().is_empty());
        assert!(matches!(f.control.delete_server(8, server.id), Err(ControlError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_publish_failure_restores_previous_status() {
        let f = fixture();
        let server = f.control.create_server(7, new_server()).unwrap();
        f.bus.set_failing(true);

        let err = f.control.dispatch(7, server.id, CommandAction::Start).await.unwrap_err();

        assert!(matches!(err, ControlError::BusUnavailable(_)));
        assert_eq!(f.control.server(7, server.id).unwrap().status, ServerStatus::Offline);
    }

    /// Records a status event for every command it is asked to send, then
    /// fails the publish.
    struct RacingBus {
        store: Arc<FileStore>,
        status: ServerStatus,
    }

    #[async_trait::async_trait]
    impl raptor_bus::MessageBus for RacingBus {
        async fn publish(&self, _topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
            let id = String::from_utf8_lossy(&payload).parse().unwrap();
            self.store.set_status(id, self.status).unwrap();
            Err(BusError::Unavailable("connection dropped mid-publish".into()))
        }

        async fn subscribe(&self, _topics: &[&str]) -> Result<raptor_bus::Subscription, BusError> {
            Err(BusError::Unavailable("not subscribable".into()))
        }

        fn is_connected(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_a_status_written_meanwhile() {
        let f = fixture();
        let store = seeded_store();
        let bus = RacingBus {
            store: store.clone(),
            status: ServerStatus::Online,
        };
        let control = ControlSurface::new(store.clone(), CommandPublisher::new(Arc::new(bus)), f.hub.clone());
        let server = control.create_server(7, new_server()).unwrap();

        let err = control.dispatch(7, server.id, CommandAction::Start).await.unwrap_err();

        assert!(matches!(err, ControlError::BusUnavailable(_)));
        assert_eq!(store.server(server.id).unwrap().status, ServerStatus::Online);
    }

    #[tokio::test]
    async fn test_backup_leaves_status_alone() {
        let f = fixture();
        let server = f.control.create_server(7, new_server()).unwrap();

        let receipt = f.control.dispatch(7, server.id, CommandAction::Backup).await.unwrap();

        assert_eq!(receipt.status, ServerStatus::Offline);
        let sent = f.bus.find_messages_by_topic("server.backup");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, BusFixtures::command(server.id, CommandAction::Backup).payload);
    }
}
