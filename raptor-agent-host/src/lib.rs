//! Raptor Agent Host - per-node execution agent
//!
//! One agent runs on every node. It:
//! - subscribes to every lifecycle command topic on the bus
//! - ignores commands for servers placed on other nodes
//! - drives the node's container engine (Docker)
//! - reports the resulting status back on `server.status`

pub mod agent;
pub mod config;
pub mod directory;
pub mod execution;
pub mod runtime;

pub use agent::Agent;
pub use config::AgentConfig;
pub use directory::{DirectoryError, KernelDirectory, NodeId, ServerDirectory, StaticDirectory};
pub use execution::{AbandonReason, LifecycleExecutor, Outcome};
pub use runtime::{ContainerHandle, ContainerRuntime, ContainerState, DockerRuntime, RuntimeError};
