//! Raptor kernel: record store, command publisher, status consumer,
//! realtime hub and the HTTP/WebSocket surface in front of them.

pub mod allocations;
pub mod config;
pub mod control;
pub mod health;
pub mod http;
pub mod hub;
pub mod models;
pub mod publisher;
pub mod status;
pub mod store;

use crate::config::KernelConfig;
use crate::control::ControlSurface;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::hub::Hub;
use crate::publisher::CommandPublisher;
use crate::status::{spawn_status_listener, StatusConsumer};
use crate::store::RecordStore;
use raptor_bus::MessageBus;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Background tasks plus the state the router is built from.
pub struct Services {
    pub state: AppState,
    pub hub_task: JoinHandle<()>,
    pub status_task: JoinHandle<()>,
}

impl Services {
    /// Starts the hub loop and the status listener; both stop on `shutdown`.
    pub fn spawn(
        config: &KernelConfig,
        store: Arc<dyn RecordStore>,
        bus: Arc<dyn MessageBus>,
        shutdown: CancellationToken,
    ) -> Services {
        let (hub, hub_task) = Hub::spawn(&config.hub, shutdown.clone());
        let health_tracker = HealthTracker::new();

        let status_task = spawn_status_listener(
            StatusConsumer::new(store.clone(), hub.clone()),
            bus.clone(),
            health_tracker.clone(),
            shutdown,
        );

        let control = ControlSurface::new(store, CommandPublisher::new(bus.clone()), hub.clone());
        let state = AppState {
            control,
            hub,
            bus,
            health_tracker,
            api_key: config.api_key.as_deref().map(Arc::from),
        };

        Services {
            state,
            hub_task,
            status_task,
        }
    }

    /// Waits for both background tasks after shutdown has been signalled.
    pub async fn join(self) {
        let _ = self.status_task.await;
        let _ = self.hub_task.await;
    }
}
