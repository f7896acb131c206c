//! In-process bus with the same delivery contract as the MQTT transport.
//!
//! Used when the kernel runs without a broker and by every test in the workspace.

use crate::bus::{MessageBus, Router, Subscription};
use crate::error::BusError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

#[derive(Clone, Default)]
pub struct MemoryBus {
    router: Arc<Router>,
    closed: Arc<AtomicBool>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing the connection: subscriptions end, publishes fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.router.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.router.subscriber_count()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Unavailable("memory bus closed".into()));
        }
        let reached = self.router.deliver(topic, &payload);
        trace!(topic, reached, "memory bus publish");
        Ok(())
    }

    async fn subscribe(&self, topics: &[&str]) -> Result<Subscription, BusError> {
        if self.is_closed() {
            return Err(BusError::Unavailable("memory bus closed".into()));
        }
        Ok(self.router.add(topics))
    }

    fn is_connected(&self) -> bool {
        !self.is_closed()
    }
}
