use crate::health::HealthTracker;
use crate::hub::Hub;
use crate::models::{Server, StatusNotice};
use crate::store::RecordStore;
use raptor_bus::{BusMessage, MessageBus, StatusEvent, Subscription, SERVER_STATUS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Applies agents' status events to the store and pushes them to viewers.
#[derive(Clone)]
pub struct StatusConsumer {
    store: Arc<dyn RecordStore>,
    hub: Hub,
}

impl StatusConsumer {
    pub fn new(store: Arc<dyn RecordStore>, hub: Hub) -> Self {
        Self { store, hub }
    }

    /// Returns the updated server, or `None` when the event was skipped.
    pub async fn apply(&self, message: &BusMessage) -> Option<Server> {
        let event = match StatusEvent::decode(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping status event: {e}");
                return None;
            }
        };

        let server = match self.store.set_status(event.server_id, event.status) {
            Ok(server) => server,
            Err(e) => {
                warn!(server_id = event.server_id, "status event skipped: {e}");
                return None;
            }
        };

        debug!(server_id = server.id, status = %server.status, "status applied");
        let notice = StatusNotice::new(server.id, server.status);
        if let Err(e) = self.hub.broadcast_to_server(&server.room(), &notice).await {
            warn!(server_id = server.id, "status push skipped: {e}");
        }
        Some(server)
    }

    /// Consumes `subscription` until it ends or `shutdown` fires.
    /// Returns `true` when the subscription ended on its own.
    pub async fn run(&self, mut subscription: Subscription, shutdown: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                message = subscription.next() => match message {
                    Some(message) => {
                        self.apply(&message).await;
                    }
                    None => return true,
                },
            }
        }
    }
}

/// Keeps a `server.status` subscription alive, subscribing again whenever it ends.
pub fn spawn_status_listener(
    consumer: StatusConsumer,
    bus: Arc<dyn MessageBus>,
    health: HealthTracker,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match bus.subscribe(&[SERVER_STATUS]).await {
                Ok(subscription) => {
                    info!("listening for status events");
                    if !consumer.run(subscription, &shutdown).await {
                        break;
                    }
                    warn!("status subscription ended");
                }
                Err(e) => warn!("status subscribe failed: {e}"),
            }
            health.increment_resubscribes();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }
        debug!("status listener stopped");
    })
}
