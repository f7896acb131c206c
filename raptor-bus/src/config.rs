use serde::{Deserialize, Serialize};

/// Broker connection settings, shared by the kernel and agent config files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    /// How long `MqttBus::connect` waits for the broker's ConnAck.
    pub connect_timeout_secs: u64,
    pub reconnect_delay_secs: u64,
    /// Capacity of the client -> event loop request queue.
    pub request_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            keep_alive_secs: 15,
            connect_timeout_secs: 5,
            reconnect_delay_secs: 2,
            request_capacity: 64,
        }
    }
}
