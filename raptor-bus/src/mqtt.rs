//! MQTT transport (rumqttc).
//!
//! All traffic uses QoS 0 on a clean session: at-most-once, nothing survives a
//! disconnect. A background task drives the event loop, fans incoming publishes
//! out to local subscriptions and re-issues broker subscriptions after each reconnect.

use crate::bus::{MessageBus, Router, Subscription};
use crate::config::BusConfig;
use crate::error::BusError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    shared: Arc<Shared>,
    _driver: Arc<DriverGuard>,
}

/// The event loop task holds its own client handle, so it is stopped explicitly
/// once the last bus handle goes away.
struct DriverGuard(JoinHandle<()>);

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Default)]
struct Shared {
    router: Router,
    broker_topics: Mutex<BTreeSet<String>>,
    connected: AtomicBool,
}

impl MqttBus {
    /// Connects to the broker and waits for its ConnAck.
    ///
    /// Fails with [`BusError::Unavailable`] when the broker does not answer within
    /// `connect_timeout_secs`; agents treat that as fatal at startup.
    pub async fn connect(config: &BusConfig, client_id: &str) -> Result<Self, BusError> {
        let mut opts = MqttOptions::new(client_id, &config.host, config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        opts.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(opts, config.request_capacity.max(1));
        let shared = Arc::new(Shared::default());
        let (ready_tx, ready_rx) = oneshot::channel();

        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            shared.clone(),
            Duration::from_secs(config.reconnect_delay_secs),
            ready_tx,
        ));

        let timeout = Duration::from_secs(config.connect_timeout_secs);
        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(())) => {
                info!(host = %config.host, port = config.port, client_id, "connected to MQTT broker");
                Ok(Self {
                    client,
                    shared,
                    _driver: Arc::new(DriverGuard(driver)),
                })
            }
            _ => {
                driver.abort();
                Err(BusError::Unavailable(format!(
                    "no answer from {}:{} within {}s",
                    config.host, config.port, config.connect_timeout_secs
                )))
            }
        }
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("MQTT disconnect: {e}");
        }
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Unavailable(format!("not connected, dropping publish on {topic}")));
        }
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))
    }

    async fn subscribe(&self, topics: &[&str]) -> Result<Subscription, BusError> {
        let subscription = self.shared.router.add(topics);

        let fresh: Vec<String> = {
            let mut known = self.shared.broker_topics.lock();
            topics
                .iter()
                .filter(|t| known.insert(t.to_string()))
                .map(|t| t.to_string())
                .collect()
        };

        for topic in fresh {
            self.client
                .subscribe(topic.as_str(), QoS::AtMostOnce)
                .await
                .map_err(|e| BusError::Unavailable(e.to_string()))?;
            debug!(topic = %topic, "subscribed on broker");
        }

        Ok(subscription)
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    reconnect_delay: Duration,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                shared.connected.store(true, Ordering::SeqCst);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(());
                } else {
                    resubscribe(&client, &shared);
                }
            }
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                warn!("MQTT broker refused connection: {:?}", ack.code);
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let reached = shared.router.deliver(&publish.topic, &publish.payload);
                trace!(topic = %publish.topic, reached, "MQTT message delivered");
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => {
                debug!("MQTT client dropped, stopping event loop");
                break;
            }
            Err(e) => {
                if shared.connected.swap(false, Ordering::SeqCst) {
                    warn!("MQTT connection lost: {e}");
                } else {
                    debug!("MQTT connection error: {e}");
                }
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    shared.router.close();
}

/// Clean sessions forget subscriptions, so replay them after every reconnect.
fn resubscribe(client: &AsyncClient, shared: &Shared) {
    let topics = shared.broker_topics.lock().clone();
    for topic in &topics {
        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
            warn!(topic = %topic, "failed to re-subscribe after reconnect: {e}");
        }
    }
    if !topics.is_empty() {
        info!(count = topics.len(), "re-subscribed after MQTT reconnect");
    }
}
