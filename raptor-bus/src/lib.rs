//! Raptor Bus - the only coupling between the control surface and node agents
//!
//! The kernel and every agent talk exclusively through a topic-based
//! publish/subscribe channel:
//! - lifecycle commands on `server.start`, `server.stop`, `server.restart`, `server.backup`
//! - authoritative status events on `server.status`
//!
//! Delivery is at-most-once: no acknowledgement, no persistence, no redelivery.
//! A subscriber that is down when a message is published never sees it.

pub mod bus;
pub mod config;
pub mod error;
pub mod memory;
pub mod messages;
pub mod mqtt;
pub mod topics;

pub use bus::{BusMessage, MessageBus, Subscription};
pub use config::BusConfig;
pub use error::BusError;
pub use memory::MemoryBus;
pub use messages::{LifecycleCommand, ServerId, ServerStatus, StatusEvent};
pub use mqtt::MqttBus;
pub use topics::{
    CommandAction, COMMAND_TOPICS, SERVER_BACKUP, SERVER_RESTART, SERVER_START, SERVER_STATUS,
    SERVER_STOP,
};
