/**
 * RECORD STORE - nodes, allocations and servers
 *
 * ROLE: the kernel's view of the fleet. Every write runs under one mutex, which
 * is the transaction: claiming an allocation and inserting the server that uses
 * it cannot interleave with another creation or deletion.
 *
 * PERSISTENCE: optional JSON snapshot. Mutations only mark the tables dirty;
 * a writer task coalesces them and writes off the async workers, so no disk
 * I/O happens under the mutex. A failed write is logged; the in-memory tables
 * stay authoritative.
 */

use crate::allocations::AllocationTable;
use crate::config::NodeSeed;
use crate::models::{
    Allocation, AllocationId, NewServer, Node, NodeId, NodeStatus, Server, ServerId, ServerStatus, UserId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("server {0} not found")]
    ServerNotFound(ServerId),
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("no available allocation on node {0}")]
    NoFreeAllocation(NodeId),
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
}

pub trait RecordStore: Send + Sync {
    fn nodes(&self) -> Vec<Node>;

    fn node(&self, id: NodeId) -> Option<Node>;

    fn allocations(&self, node_id: NodeId) -> Vec<Allocation>;

    fn server(&self, id: ServerId) -> Option<Server>;

    fn servers_owned_by(&self, owner: UserId) -> Vec<Server>;

    fn server_count(&self) -> usize;

    /// Claims an allocation on `request.node_id` and inserts the server atomically.
    fn create_server(&self, owner: UserId, request: NewServer) -> Result<Server, StoreError>;

    /// Removes the server and releases its allocation atomically.
    fn delete_server(&self, id: ServerId) -> Result<Server, StoreError>;

    fn servers_with_status(&self, status: ServerStatus) -> usize;

    fn set_status(&self, id: ServerId, status: ServerStatus) -> Result<Server, StoreError>;

    /// Sets `status` only while the recorded one is still `expected`.
    /// `Ok(None)` means someone else wrote in between and nothing changed.
    fn set_status_if(
        &self,
        id: ServerId,
        expected: ServerStatus,
        status: ServerStatus,
    ) -> Result<Option<Server>, StoreError>;

    /// Read-by-owner: `None` both when the server is missing and when it belongs to someone else.
    fn owned_server(&self, id: ServerId, owner: UserId) -> Option<Server> {
        self.server(id).filter(|server| server.owner_id == owner)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    nodes: BTreeMap<NodeId, Node>,
    allocations: AllocationTable,
    servers: BTreeMap<ServerId, Server>,
    next_server_id: ServerId,
}

pub struct FileStore {
    tables: Mutex<Tables>,
    data_file: Option<PathBuf>,
    /// Bumped on every mutation; the writer task waits on it.
    revision: watch::Sender<u64>,
}

impl FileStore {
    pub fn in_memory() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            data_file: None,
            revision: watch::Sender::new(0),
        }
    }

    /// Loads the snapshot at `path` if present; later mutations are written back to it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tables = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let tables: Tables = serde_json::from_str(&content)?;
            info!(
                servers = tables.servers.len(),
                nodes = tables.nodes.len(),
                "loaded store snapshot from {}",
                path.display()
            );
            tables
        } else {
            Tables::default()
        };

        Ok(Self {
            tables: Mutex::new(tables),
            data_file: Some(path),
            revision: watch::Sender::new(0),
        })
    }

    /// Creates the configured nodes and their allocations when the store has none yet.
    /// Returns the number of nodes created.
    pub fn seed_nodes(&self, seeds: &[NodeSeed]) -> usize {
        let mut tables = self.tables.lock();
        if !tables.nodes.is_empty() || seeds.is_empty() {
            return 0;
        }

        let now = OffsetDateTime::now_utc();
        for (index, seed) in seeds.iter().enumerate() {
            let id = index as NodeId + 1;
            tables.nodes.insert(
                id,
                Node {
                    id,
                    name: seed.name.clone(),
                    hostname: seed.hostname.clone(),
                    ip: seed.ip.clone(),
                    port: seed.port,
                    total_ram: seed.total_ram,
                    total_cpu: seed.total_cpu,
                    total_disk: seed.total_disk,
                    used_ram: 0,
                    used_cpu: 0,
                    used_disk: 0,
                    status: NodeStatus::Offline,
                    created_at: now,
                },
            );
            for block in &seed.allocations {
                for port in &block.ports {
                    tables.allocations.add(id, &block.ip, *port);
                }
            }
        }

        self.mark_dirty();
        seeds.len()
    }

    fn mark_dirty(&self) {
        if self.data_file.is_some() {
            self.revision.send_modify(|revision| *revision += 1);
        }
    }

    /// Writes the current tables to the snapshot file. Blocking; the mutex is
    /// held only while serialising.
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.data_file else { return Ok(()) };
        let snapshot = serde_json::to_vec_pretty(&*self.tables.lock())?;
        write_snapshot(path, &snapshot)
    }

    async fn flush_in_background(self: &Arc<Self>) {
        let store = self.clone();
        match tokio::task::spawn_blocking(move || store.flush()).await {
            Ok(Ok(())) => debug!("store snapshot written"),
            Ok(Err(e)) => error!("failed to save store snapshot: {e}"),
            Err(e) => error!("store snapshot task failed: {e}"),
        }
    }

    /// Writes a snapshot after each burst of mutations, waiting `debounce` for
    /// the burst to settle. Flushes once more on shutdown.
    pub fn spawn_writer(self: Arc<Self>, debounce: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut revisions = self.revision.subscribe();
        // Whatever happened before the writer existed (seeding) is written too.
        revisions.mark_changed();

        tokio::spawn(async move {
            if self.data_file.is_none() {
                return;
            }
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = revisions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(debounce) => {}
                }
                revisions.borrow_and_update();
                self.flush_in_background().await;
            }
            self.flush_in_background().await;
            info!("store writer stopped");
        })
    }

    #[cfg(test)]
    fn check_consistency(&self) -> Result<(), String> {
        let tables = self.tables.lock();
        let mut holders: BTreeMap<AllocationId, ServerId> = BTreeMap::new();
        for server in tables.servers.values() {
            if let Some(other) = holders.insert(server.allocation_id, server.id) {
                return Err(format!(
                    "servers {} and {} share allocation {}",
                    other, server.id, server.allocation_id
                ));
            }
            match tables.allocations.get(server.allocation_id) {
                Some(a) if a.assigned => {}
                _ => return Err(format!("server {} holds a free allocation", server.id)),
            }
        }
        if tables.allocations.assigned_count() != tables.servers.len() {
            return Err("assigned allocations without a server".into());
        }
        Ok(())
    }
}

fn write_snapshot(path: &Path, snapshot: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, snapshot)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl RecordStore for FileStore {
    fn nodes(&self) -> Vec<Node> {
        self.tables.lock().nodes.values().cloned().collect()
    }

    fn node(&self, id: NodeId) -> Option<Node> {
        self.tables.lock().nodes.get(&id).cloned()
    }

    fn allocations(&self, node_id: NodeId) -> Vec<Allocation> {
        self.tables.lock().allocations.for_node(node_id).cloned().collect()
    }

    fn server(&self, id: ServerId) -> Option<Server> {
        self.tables.lock().servers.get(&id).cloned()
    }

    fn servers_owned_by(&self, owner: UserId) -> Vec<Server> {
        self.tables
            .lock()
            .servers
            .values()
            .filter(|s| s.owner_id == owner)
            .cloned()
            .collect()
    }

    fn server_count(&self) -> usize {
        self.tables.lock().servers.len()
    }

    fn servers_with_status(&self, status: ServerStatus) -> usize {
        self.tables.lock().servers.values().filter(|s| s.status == status).count()
    }

    fn create_server(&self, owner: UserId, request: NewServer) -> Result<Server, StoreError> {
        let mut tables = self.tables.lock();
        if !tables.nodes.contains_key(&request.node_id) {
            return Err(StoreError::NodeNotFound(request.node_id));
        }

        let allocation = tables
            .allocations
            .claim(request.node_id)
            .ok_or(StoreError::NoFreeAllocation(request.node_id))?;

        tables.next_server_id += 1;
        let now = OffsetDateTime::now_utc();
        let server = Server {
            id: tables.next_server_id,
            uuid: Uuid::new_v4(),
            name: request.name,
            owner_id: owner,
            node_id: request.node_id,
            allocation_id: allocation.id,
            image: request.image,
            limits: request.limits,
            status: ServerStatus::Offline,
            created_at: now,
            updated_at: now,
        };
        tables.servers.insert(server.id, server.clone());

        self.mark_dirty();
        info!(
            server_id = server.id,
            node_id = server.node_id,
            port = allocation.port,
            "server provisioned"
        );
        Ok(server)
    }

    fn delete_server(&self, id: ServerId) -> Result<Server, StoreError> {
        let mut tables = self.tables.lock();
        let server = tables.servers.remove(&id).ok_or(StoreError::ServerNotFound(id))?;
        if !tables.allocations.release(server.allocation_id) {
            error!(
                server_id = id,
                allocation_id = server.allocation_id,
                "deleted server referenced a missing allocation"
            );
        }

        self.mark_dirty();
        info!(server_id = id, "server deleted");
        Ok(server)
    }

    fn set_status(&self, id: ServerId, status: ServerStatus) -> Result<Server, StoreError> {
        let mut tables = self.tables.lock();
        let server = tables.servers.get_mut(&id).ok_or(StoreError::ServerNotFound(id))?;
        server.status = status;
        server.updated_at = OffsetDateTime::now_utc();
        let updated = server.clone();

        self.mark_dirty();
        Ok(updated)
    }

    fn set_status_if(
        &self,
        id: ServerId,
        expected: ServerStatus,
        status: ServerStatus,
    ) -> Result<Option<Server>, StoreError> {
        let mut tables = self.tables.lock();
        let server = tables.servers.get_mut(&id).ok_or(StoreError::ServerNotFound(id))?;
        if server.status != expected {
            return Ok(None);
        }
        server.status = status;
        server.updated_at = OffsetDateTime::now_utc();
        let updated = server.clone();

        self.mark_dirty();
        Ok(Some(updated))
    }
}
