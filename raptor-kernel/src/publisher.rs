use crate::models::ServerId;
use raptor_bus::{BusError, CommandAction, LifecycleCommand, MessageBus};
use std::sync::Arc;
use tracing::{debug, warn};

/// Fire-and-forget command publisher. There is no command journal: an
/// accepted publish is not a delivery guarantee.
#[derive(Clone)]
pub struct CommandPublisher {
    bus: Arc<dyn MessageBus>,
}

impl CommandPublisher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Surfaces a bus outage to the caller instead of dropping the intent.
    pub async fn publish(&self, server_id: ServerId, action: CommandAction) -> Result<(), BusError> {
        let command = LifecycleCommand::new(server_id, action);
        match self.bus.publish(command.topic(), command.encode()).await {
            Ok(()) => {
                debug!(server_id, %action, "command published");
                Ok(())
            }
            Err(e) => {
                warn!(server_id, %action, "command publish failed: {e}");
                Err(e)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.bus.is_connected()
    }
}
