//! Receive loop: one subscription to every command topic, one task per command.

use crate::execution::{LifecycleExecutor, Outcome};
use raptor_bus::{BusError, BusMessage, LifecycleCommand, MessageBus, COMMAND_TOPICS};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

pub struct Agent {
    executor: Arc<LifecycleExecutor>,
    bus: Arc<dyn MessageBus>,
    tracker: TaskTracker,
}

impl Agent {
    pub fn new(executor: Arc<LifecycleExecutor>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            executor,
            bus,
            tracker: TaskTracker::new(),
        }
    }

    /// Runs until `shutdown` fires or the bus subscription ends.
    ///
    /// In both cases in-flight commands run to completion before this returns.
    /// A lost subscription is reported as `BusError::Unavailable`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), BusError> {
        let mut subscription = self.bus.subscribe(&COMMAND_TOPICS).await?;
        info!(
            node_id = self.executor.node_id(),
            topics = ?subscription.topics(),
            "listening for lifecycle commands"
        );

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, no longer accepting commands");
                    break Ok(());
                }
                message = subscription.next() => match message {
                    Some(message) => {
                        self.dispatch(message);
                    }
                    None => {
                        error!("command subscription ended");
                        break Err(BusError::Unavailable("command subscription ended".into()));
                    }
                }
            }
        };

        self.tracker.close();
        if !self.tracker.is_empty() {
            info!(in_flight = self.tracker.len(), "waiting for in-flight commands");
        }
        self.tracker.wait().await;
        result
    }

    /// Spawns the handling of one raw bus message. Malformed payloads are logged and dropped.
    pub fn dispatch(&self, message: BusMessage) -> Option<JoinHandle<Outcome>> {
        match LifecycleCommand::decode(&message.topic, &message.payload) {
            Ok(command) => {
                let executor = self.executor.clone();
                Some(self.tracker.spawn(async move { executor.execute(command).await }))
            }
            Err(e) => {
                warn!(topic = %message.topic, "discarding command: {e}");
                None
            }
        }
    }
}
