//! Server ownership lookup
//!
//! Every agent receives every command; it must act only on servers placed on
//! its own node. The directory answers "which node hosts server N?".

use async_trait::async_trait;
use parking_lot::Mutex;
use raptor_bus::ServerId;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

pub type NodeId = u64;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("kernel directory unreachable: {0}")]
    Unavailable(String),

    #[error("kernel directory answered HTTP {0}")]
    UnexpectedStatus(u16),

    #[error("invalid directory response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ServerDirectory: Send + Sync {
    /// Node hosting `server_id`, or `None` when the server is unknown.
    async fn node_of(&self, server_id: ServerId) -> Result<Option<NodeId>, DirectoryError>;
}

/// Fixed list of servers known to live on this node.
pub struct StaticDirectory {
    node_id: NodeId,
    servers: HashSet<ServerId>,
}

impl StaticDirectory {
    pub fn new(node_id: NodeId, servers: impl IntoIterator<Item = ServerId>) -> Self {
        Self {
            node_id,
            servers: servers.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ServerDirectory for StaticDirectory {
    async fn node_of(&self, server_id: ServerId) -> Result<Option<NodeId>, DirectoryError> {
        Ok(self.servers.contains(&server_id).then_some(self.node_id))
    }
}

#[derive(Debug, Deserialize)]
struct Placement {
    node_id: NodeId,
}

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Asks the kernel's internal endpoint and remembers the answer for a while.
///
/// Positive answers expire after `cache_ttl`: a kernel with a non-persistent
/// store hands out ids again after a restart, so a cached placement can end up
/// naming another node's server. Unknown servers are never cached.
pub struct KernelDirectory {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<ServerId, (NodeId, Instant)>>,
}

impl KernelDirectory {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    fn placement_url(&self, server_id: ServerId) -> String {
        format!("{}/internal/servers/{}", self.base_url, server_id)
    }

    /// Cached placement, if it is still fresh. Expired entries are evicted.
    pub fn cached(&self, server_id: ServerId) -> Option<NodeId> {
        let mut cache = self.cache.lock();
        match cache.get(&server_id) {
            Some(&(node_id, stored_at)) if stored_at.elapsed() < self.cache_ttl => Some(node_id),
            Some(_) => {
                cache.remove(&server_id);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl ServerDirectory for KernelDirectory {
    async fn node_of(&self, server_id: ServerId) -> Result<Option<NodeId>, DirectoryError> {
        if let Some(node_id) = self.cached(server_id) {
            return Ok(Some(node_id));
        }

        let mut request = self.client.get(self.placement_url(server_id));
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => {
                debug!(server_id, "server unknown to the kernel");
                self.cache.lock().remove(&server_id);
                Ok(None)
            }
            status if status.is_success() => {
                let placement: Placement = response
                    .json()
                    .await
                    .map_err(|e| DirectoryError::Decode(e.to_string()))?;
                self.cache
                    .lock()
                    .insert(server_id, (placement.node_id, Instant::now()));
                Ok(Some(placement.node_id))
            }
            status => Err(DirectoryError::UnexpectedStatus(status.as_u16())),
        }
    }
}
