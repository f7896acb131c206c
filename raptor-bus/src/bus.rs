use crate::error::BusError;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// One delivered `(topic, payload)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Topic-based publish/subscribe channel.
///
/// `publish` enqueues and returns without waiting for any subscriber.
/// `subscribe` hands back a lazy, unbounded sequence that ends when the
/// underlying connection dies; the only way to restart it is to subscribe again.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn subscribe(&self, topics: &[&str]) -> Result<Subscription, BusError>;

    /// Best-effort view of the connection, for health reporting.
    fn is_connected(&self) -> bool;
}

/// Receiving half of a subscription.
#[derive(Debug)]
pub struct Subscription {
    topics: Vec<String>,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    pub fn new(topics: Vec<String>, receiver: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self { topics, receiver }
    }

    /// Next message, or `None` once the bus connection is gone.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// Non-blocking poll; `None` when nothing is queued right now.
    pub fn try_next(&mut self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }
}

struct Route {
    topics: Vec<String>,
    sender: mpsc::UnboundedSender<BusMessage>,
}

/// In-process fan-out table shared by the transports.
#[derive(Default)]
pub(crate) struct Router {
    routes: Mutex<Vec<Route>>,
}

impl Router {
    pub(crate) fn add(&self, topics: &[&str]) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        self.routes.lock().push(Route {
            topics: topics.clone(),
            sender,
        });
        Subscription::new(topics, receiver)
    }

    /// Fans `payload` out to every live subscriber of `topic`. Returns the number reached.
    pub(crate) fn deliver(&self, topic: &str, payload: &[u8]) -> usize {
        let mut routes = self.routes.lock();
        routes.retain(|route| !route.sender.is_closed());

        let mut delivered = 0;
        for route in routes.iter().filter(|r| r.topics.iter().any(|t| t == topic)) {
            if route.sender.send(BusMessage::new(topic, payload)).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drops every sender, ending all subscriptions.
    pub(crate) fn close(&self) {
        self.routes.lock().clear();
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        let mut routes = self.routes.lock();
        routes.retain(|route| !route.sender.is_closed());
        routes.len()
    }
}
