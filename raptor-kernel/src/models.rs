use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub use raptor_bus::{ServerId, ServerStatus};

pub type NodeId = u64;
pub type AllocationId = u64;
pub type UserId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    #[default]
    Offline,
}

/// A host running one agent. Capacity counters are informational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub total_ram: u64,
    pub total_cpu: u64,
    pub total_disk: u64,
    pub used_ram: u64,
    pub used_cpu: u64,
    pub used_disk: u64,
    pub status: NodeStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One (node, port) pair. At most one live server holds it while `assigned`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub node_id: NodeId,
    pub ip: String,
    pub port: u16,
    pub assigned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceLimits {
    /// Bytes.
    pub memory: u64,
    /// Nano-CPUs (1e9 = one core).
    pub cpu: u64,
    /// Bytes.
    pub disk: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    /// Stable public identity; viewers watch a server by this value.
    pub uuid: Uuid,
    pub name: String,
    pub owner_id: UserId,
    pub node_id: NodeId,
    pub allocation_id: AllocationId,
    pub image: String,
    pub limits: ResourceLimits,
    pub status: ServerStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Server {
    /// Affinity key used by the realtime hub.
    pub fn room(&self) -> String {
        self.uuid.to_string()
    }
}

/// Provisioning request; the owner comes from the caller's identity.
#[derive(Debug, Clone, Deserialize)]
pub struct NewServer {
    pub name: String,
    pub node_id: NodeId,
    pub image: String,
    #[serde(default)]
    pub limits: ResourceLimits,
}

/// Pushed to viewers whenever a server's status changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusNotice {
    #[serde(rename = "type")]
    pub kind: String,
    pub server_id: ServerId,
    pub status: ServerStatus,
}

impl StatusNotice {
    pub const KIND: &'static str = "server.status";

    pub fn new(server_id: ServerId, status: ServerStatus) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            server_id,
            status,
        }
    }
}
