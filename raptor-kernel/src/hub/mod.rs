/**
 * REALTIME HUB - fan-out of status pushes to live viewers
 *
 * ROLE: keeps the set of viewer connections and their partition by watched
 * server, and pushes each status change to exactly the viewers of that server.
 *
 * HOW IT WORKS:
 * - one loop task owns `HubState`; every mutation and broadcast arrives as a
 *   `HubCommand` on a bounded channel, so no two mutations ever race
 * - `Hub` is the cloneable handle used by HTTP handlers, the status consumer
 *   and each viewer's read task
 * - messages are serialised once per broadcast and shared as `Arc<str>`
 * - a viewer whose outbound queue is full is disconnected, never waited on
 */

pub mod state;
pub mod ws;

use crate::config::HubConfig;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub use state::{ConnectionState, Delivery, HubState};

pub type ConnectionId = Uuid;

/// One serialised frame, shared between every recipient queue.
pub type Outbound = Arc<str>;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("realtime hub is not running")]
    Stopped,
    #[error("failed to serialise hub message: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: usize,
}

#[derive(Debug)]
pub enum HubCommand {
    Register {
        id: ConnectionId,
        outbound: mpsc::Sender<Outbound>,
    },
    SetAffinity {
        id: ConnectionId,
        server: String,
    },
    Unregister {
        id: ConnectionId,
    },
    BroadcastToServer {
        server: String,
        payload: Outbound,
    },
    Broadcast {
        payload: Outbound,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<HubCommand>,
    outbound_capacity: usize,
    relay_viewer_frames: bool,
}

/// The owning side; run it with [`HubLoop::run`].
pub struct HubLoop {
    commands: mpsc::Receiver<HubCommand>,
    state: HubState,
}

impl Hub {
    pub fn new(config: &HubConfig) -> (Hub, HubLoop) {
        let (tx, rx) = mpsc::channel(config.command_queue.max(1));
        let hub = Hub {
            commands: tx,
            outbound_capacity: config.outbound_queue.max(1),
            relay_viewer_frames: config.relay_viewer_frames,
        };
        let hub_loop = HubLoop {
            commands: rx,
            state: HubState::default(),
        };
        (hub, hub_loop)
    }

    /// Starts the loop on the current runtime.
    pub fn spawn(config: &HubConfig, shutdown: CancellationToken) -> (Hub, tokio::task::JoinHandle<()>) {
        let (hub, hub_loop) = Self::new(config);
        let task = tokio::spawn(hub_loop.run(shutdown));
        (hub, task)
    }

    /// Bounded queue for one viewer, sized from the hub config.
    pub fn outbound_queue(&self) -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
        mpsc::channel(self.outbound_capacity)
    }

    pub fn relays_viewer_frames(&self) -> bool {
        self.relay_viewer_frames
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Stopped)
    }

    /// Adds a viewer with no affinity and returns its id.
    pub async fn register(&self, outbound: mpsc::Sender<Outbound>) -> Result<ConnectionId, HubError> {
        let id = Uuid::new_v4();
        self.send(HubCommand::Register { id, outbound }).await?;
        Ok(id)
    }

    pub async fn set_affinity(&self, id: ConnectionId, server: impl Into<String>) -> Result<(), HubError> {
        self.send(HubCommand::SetAffinity {
            id,
            server: server.into(),
        })
        .await
    }

    /// Call once per registered viewer.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.send(HubCommand::Unregister { id }).await
    }

    pub async fn broadcast_to_server<T: Serialize>(&self, server: &str, message: &T) -> Result<(), HubError> {
        let payload: Outbound = Arc::from(serde_json::to_string(message)?);
        self.send(HubCommand::BroadcastToServer {
            server: server.to_string(),
            payload,
        })
        .await
    }

    pub async fn broadcast<T: Serialize>(&self, message: &T) -> Result<(), HubError> {
        let payload: Outbound = Arc::from(serde_json::to_string(message)?);
        self.broadcast_raw(payload).await
    }

    /// Broadcasts an already-serialised frame as is.
    pub async fn broadcast_raw(&self, payload: Outbound) -> Result<(), HubError> {
        self.send(HubCommand::Broadcast { payload }).await
    }

    /// Counts after every previously sent command has been applied.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply }).await?;
        rx.await.map_err(|_| HubError::Stopped)
    }
}

impl HubLoop {
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("realtime hub started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
            }
        }
        self.state.close_all();
    }

    fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { id, outbound } => self.state.register(id, outbound),
            HubCommand::SetAffinity { id, server } => self.state.set_affinity(id, server),
            HubCommand::Unregister { id } => {
                self.state.unregister(id);
            }
            HubCommand::BroadcastToServer { server, payload } => {
                let delivery = self.state.broadcast_to_server(&server, &payload);
                debug!(server = %server, delivered = delivery.delivered, dropped = delivery.dropped, "room broadcast");
            }
            HubCommand::Broadcast { payload } => {
                let delivery = self.state.broadcast(&payload);
                debug!(delivered = delivery.delivered, dropped = delivery.dropped, "global broadcast");
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(self.state.stats());
            }
        }
    }
}
