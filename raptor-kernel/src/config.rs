use raptor_bus::BusConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{error, warn};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    /// HTTP + WebSocket listen address.
    pub listen: String,
    /// Required in `x-api-key` on every route except `/health` and `/ws`.
    /// `RAPTOR_API_KEY` overrides it.
    pub api_key: Option<String>,
    pub bus: BusSection,
    pub hub: HubConfig,
    pub store: StoreConfig,
    /// Nodes and allocations created on first boot, when the store is empty.
    pub nodes: Vec<NodeSeed>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Mqtt,
    /// In-process bus, for running the kernel alone.
    Memory,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BusSection {
    pub transport: Transport,
    #[serde(flatten)]
    pub mqtt: BusConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HubConfig {
    /// Per-viewer outbound queue; a viewer whose queue is full is disconnected.
    pub outbound_queue: usize,
    pub command_queue: usize,
    /// Re-broadcast viewer frames that are not affinity declarations.
    pub relay_viewer_frames: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub data_file: Option<PathBuf>,
    /// Mutations inside this window are written out as one snapshot.
    pub flush_debounce_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_file: None,
            flush_debounce_ms: 250,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodeSeed {
    pub name: String,
    pub hostname: String,
    pub ip: String,
    #[serde(default = "default_node_port")]
    pub port: u16,
    #[serde(default)]
    pub total_ram: u64,
    #[serde(default)]
    pub total_cpu: u64,
    #[serde(default)]
    pub total_disk: u64,
    #[serde(default)]
    pub allocations: Vec<AllocationSeed>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AllocationSeed {
    pub ip: String,
    pub ports: Vec<u16>,
}

fn default_node_port() -> u16 {
    8080
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".into(),
            api_key: None,
            bus: BusSection::default(),
            hub: HubConfig::default(),
            store: StoreConfig::default(),
            nodes: Vec::new(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            command_queue: 1024,
            relay_viewer_frames: true,
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("RAPTOR_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut config = read_config(Path::new(&path)).await;

    if let Ok(key) = std::env::var("RAPTOR_API_KEY") {
        if !key.is_empty() {
            config.api_key = Some(key);
        }
    }
    config
}

async fn read_config(path: &Path) -> KernelConfig {
    if !path.exists() {
        warn!("no {}, using default config", path.display());
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        error!("invalid config {}: {e}", path.display());
        KernelConfig::default()
    })
}
