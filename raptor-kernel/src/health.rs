use crate::hub::HubStats;
use crate::models::{NodeStatus, ServerStatus};
use crate::store::RecordStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub servers_tracked: u32,
    pub servers_online: u32,
    pub nodes_tracked: u32,
    pub nodes_online: u32,
    pub viewers_connected: u32,
    pub rooms_active: u32,
    pub memory_usage_mb: f32,
    pub bus_status: String,
    pub bus_resubscribes: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    bus_resubscribes: Arc<AtomicU32>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bus_resubscribes: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn increment_resubscribes(&self) {
        self.bus_resubscribes.fetch_add(1, Ordering::Relaxed);
    }

    /// `hub` is `None` when the hub loop has stopped.
    pub fn get_health(&self, store: &dyn RecordStore, hub: Option<HubStats>, bus_connected: bool) -> KernelHealth {
        let hub = hub.unwrap_or(HubStats { connections: 0, rooms: 0 });
        let nodes = store.nodes();

        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            servers_tracked: store.server_count() as u32,
            servers_online: store.servers_with_status(ServerStatus::Online) as u32,
            nodes_tracked: nodes.len() as u32,
            nodes_online: nodes.iter().filter(|n| n.status == NodeStatus::Online).count() as u32,
            viewers_connected: hub.connections as u32,
            rooms_active: hub.rooms as u32,
            memory_usage_mb: get_memory_usage_mb(),
            bus_status: if bus_connected { "connected" } else { "disconnected" }.to_string(),
            bus_resubscribes: self.bus_resubscribes.load(Ordering::Relaxed),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
