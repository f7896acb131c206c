//! Agent configuration
//!
//! Handles:
//! - node identity
//! - MQTT broker settings
//! - Docker endpoint, container label and grace period
//! - where to learn which servers live on this node
//!
//! Read from TOML at `RAPTOR_AGENT_CONFIG` or the OS config directory, then
//! overridden by `NODE_ID`, `MQTT_HOST`, `MQTT_PORT` and `DOCKER_HOST`.

use crate::directory::{KernelDirectory, NodeId, ServerDirectory, StaticDirectory};
use anyhow::{Context, Result};
use raptor_bus::{BusConfig, ServerId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentInfo,
    pub mqtt: MqttConfig,
    pub docker: DockerConfig,
    pub directory: DirectoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentInfo {
    pub node_id: NodeId,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    #[serde(flatten)]
    pub bus: BusConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DockerConfig {
    /// `unix:///var/run/docker.sock`, `http://host:2375`, or unset for the local default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub label_key: String,
    pub grace_period_secs: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Kernel base URL; when set, placement is asked from `/internal/servers/{id}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    /// How long a kernel placement answer is trusted before asking again.
    pub cache_ttl_secs: u64,
    /// Servers hosted here, used when no kernel URL is configured.
    pub servers: Vec<ServerId>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent: AgentInfo::default(),
            mqtt: MqttConfig::default(),
            docker: DockerConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            node_id: 1,
            hostname: hostname::get().unwrap_or_default().to_string_lossy().to_string(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            client_id: None,
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            label_key: "server.id".to_string(),
            grace_period_secs: 10,
            timeout_secs: 120,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            kernel_url: None,
            api_key: None,
            timeout_secs: 5,
            cache_ttl_secs: 30,
            servers: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load config from `RAPTOR_AGENT_CONFIG` or the OS-specific location, then apply env overrides.
    pub async fn load() -> Result<Self> {
        let config_path = match std::env::var("RAPTOR_AGENT_CONFIG") {
            Ok(path) => PathBuf::from(path),
            Err(_) => Self::config_file_path()?,
        };

        let mut config = if config_path.exists() {
            Self::from_file(&config_path).await?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub async fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid agent config {}", path.display()))
    }

    /// Save config to the OS-specific location
    pub async fn save(&self) -> Result<PathBuf> {
        let config_path = Self::config_file_path()?;
        self.save_to(&config_path).await?;
        Ok(config_path)
    }

    pub async fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("raptor-agent");
        path.push("config.toml");
        Ok(path)
    }

    pub fn is_first_time_setup() -> bool {
        if std::env::var_os("RAPTOR_AGENT_CONFIG").is_some() {
            return false;
        }
        Self::config_file_path()
            .map(|p| !p.exists())
            .unwrap_or(true)
    }

    /// Environment wins over the file for the deployment-specific settings.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(node_id) = lookup("NODE_ID") {
            self.agent.node_id = node_id
                .trim()
                .parse()
                .with_context(|| format!("NODE_ID must be numeric, got {node_id:?}"))?;
        }
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.bus.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.bus.port = port
                .trim()
                .parse()
                .with_context(|| format!("MQTT_PORT must be a port number, got {port:?}"))?;
        }
        if let Some(host) = lookup("DOCKER_HOST") {
            self.docker.host = Some(host);
        }
        Ok(())
    }

    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("raptor-agent-{}", self.agent.node_id))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.docker.grace_period_secs)
    }

    pub fn build_directory(&self) -> Result<Arc<dyn ServerDirectory>> {
        match &self.directory.kernel_url {
            Some(url) => {
                let directory = KernelDirectory::new(
                    url,
                    self.directory.api_key.clone(),
                    Duration::from_secs(self.directory.timeout_secs),
                )
                .context("Failed to build kernel directory client")?
                .with_cache_ttl(Duration::from_secs(self.directory.cache_ttl_secs));
                Ok(Arc::new(directory))
            }
            None => Ok(Arc::new(StaticDirectory::new(
                self.agent.node_id,
                self.directory.servers.iter().copied(),
            ))),
        }
    }
}
