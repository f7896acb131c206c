/*!
Recording bus for tests without a broker

Wraps a `MemoryBus` so subscribers still receive traffic, while every publish
is kept for assertions. Outages can be simulated either as failing publishes
or as a dropped connection.
*/

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use raptor_bus::{
    BusError, BusMessage, CommandAction, LifecycleCommand, MemoryBus, MessageBus, ServerId,
    ServerStatus, StatusEvent, Subscription, SERVER_STATUS,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl RecordedMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Clone, Default)]
pub struct RecordingBus {
    inner: MemoryBus,
    published: Arc<Mutex<Vec<RecordedMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every publish fails with `BusError::Unavailable` and is not recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Simulates losing the broker: open subscriptions end, later calls fail.
    pub fn disconnect(&self) {
        self.inner.close();
        log::info!("[MOCK] bus disconnected");
    }

    /// Injects a message as if another process had published it. Not recorded.
    pub async fn simulate_incoming(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.inner.publish(topic, payload.into()).await?;
        log::info!("[MOCK] simulated incoming on {}", topic);
        Ok(())
    }

    pub fn get_published_messages(&self) -> Vec<RecordedMessage> {
        self.published.lock().clone()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<RecordedMessage> {
        self.published
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }

    /// Every well-formed status event published so far, in order.
    pub fn status_events(&self) -> Vec<StatusEvent> {
        self.find_messages_by_topic(SERVER_STATUS)
            .iter()
            .filter_map(|msg| StatusEvent::decode(&msg.payload).ok())
            .collect()
    }

    /// Every lifecycle command published so far, in order.
    pub fn commands(&self) -> Vec<LifecycleCommand> {
        self.published
            .lock()
            .iter()
            .filter_map(|msg| LifecycleCommand::decode(&msg.topic, &msg.payload).ok())
            .collect()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("simulated outage".into()));
        }
        self.inner.publish(topic, payload.clone()).await?;
        log::info!("[MOCK] published to {}: {} bytes", topic, payload.len());
        self.published.lock().push(RecordedMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, topics: &[&str]) -> Result<Subscription, BusError> {
        let subscription = self.inner.subscribe(topics).await?;
        self.subscriptions
            .lock()
            .extend(topics.iter().map(|t| t.to_string()));
        log::info!("[MOCK] subscribed to {:?}", topics);
        Ok(subscription)
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected() && !self.failing.load(Ordering::SeqCst)
    }
}

/// Ready-made wire messages.
pub struct BusFixtures;

impl BusFixtures {
    pub fn command(server_id: ServerId, action: CommandAction) -> BusMessage {
        let cmd = LifecycleCommand::new(server_id, action);
        BusMessage::new(cmd.topic(), cmd.encode())
    }

    pub fn status(server_id: ServerId, status: ServerStatus) -> BusMessage {
        let payload = serde_json::json!({ "server_id": server_id, "status": status });
        BusMessage::new(SERVER_STATUS, payload.to_string())
    }

    /// Frame a viewer sends to declare which server it is watching.
    pub fn watch_frame(server_uuid: &str) -> String {
        serde_json::json!({ "server_id": server_uuid }).to_string()
    }
}
