/*!
Test harness for kernel and agent suites

- recording bus set up with logging
- expectations on the number of messages per topic
- polling waits for asynchronously published traffic
*/

use crate::bus_stub::{BusFixtures, RecordingBus};
use anyhow::Result;
use raptor_bus::{CommandAction, ServerId, StatusEvent};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `condition` until it holds or `timeout` elapses. Returns the last result.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

pub struct TestHarness {
    pub bus: RecordingBus,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();

        Self {
            bus: RecordingBus::new(),
            expectations: Vec::new(),
        }
    }

    /// Expect exactly `count` publishes on `topic` by the time `verify_expectations` runs.
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    /// Delivers a lifecycle command to subscribers as if the kernel had sent it.
    pub async fn send_command(&self, server_id: ServerId, action: CommandAction) -> Result<()> {
        let msg = BusFixtures::command(server_id, action);
        self.bus.simulate_incoming(&msg.topic, msg.payload).await?;
        log::info!("sent {} for server {}", action, server_id);
        Ok(())
    }

    /// Sends raw bytes on a topic, for malformed-payload tests.
    pub async fn send_raw(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.bus.simulate_incoming(topic, payload.to_vec()).await
    }

    /// Waits for a status event for `server_id` and returns the first one seen.
    pub async fn wait_for_status(&self, server_id: ServerId, timeout_ms: u64) -> Option<StatusEvent> {
        let find = || {
            self.bus
                .status_events()
                .into_iter()
                .find(|event| event.server_id == server_id)
        };
        if wait_until(Duration::from_millis(timeout_ms), || find().is_some()).await {
            return find();
        }
        None
    }

    pub async fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual_count = self.bus.find_messages_by_topic(&expectation.topic).len();

            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual_count
                );
            }
        }
        Ok(())
    }

    pub fn assert_message_sent(&self, topic: &str, expected_payload: &Value) -> Result<()> {
        for msg in self.bus.find_messages_by_topic(topic) {
            let payload: Value = serde_json::from_slice(&msg.payload)?;
            if payload == *expected_payload {
                return Ok(());
            }
        }
        anyhow::bail!("Expected message not found on topic: {}", topic);
    }

    pub fn assert_field_equals(&self, topic: &str, field: &str, expected: &Value) -> Result<()> {
        match self.bus.get_last_json_message::<Value>(topic)? {
            Some(msg) => match msg.get(field) {
                Some(actual) if actual == expected => Ok(()),
                Some(actual) => anyhow::bail!(
                    "Field '{}' mismatch: expected {:?}, got {:?}",
                    field,
                    expected,
                    actual
                ),
                None => anyhow::bail!("Field '{}' not found in latest message on {}", field, topic),
            },
            None => anyhow::bail!("No message published on {}", topic),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let messages = self.bus.get_published_messages();
        let mut topic_counts = HashMap::new();

        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }

        TestStats {
            total_messages: messages.len(),
            topic_counts,
            subscriptions: self.bus.get_subscriptions(),
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub subscriptions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use raptor_bus::{MessageBus, ServerStatus, SERVER_STATUS};

    #[tokio::test]
    async fn test_harness_basic_functionality() {
        let mut harness = TestHarness::new();
        harness.expect_messages(SERVER_STATUS, 1);

        let event = StatusEvent::new(1, ServerStatus::Online);
        harness
            .bus
            .publish(SERVER_STATUS, event.encode().unwrap())
            .await
            .unwrap();

        harness.verify_expectations().await.unwrap();
        harness
            .assert_message_sent(SERVER_STATUS, &serde_json::json!({"server_id": 1, "status": "online"}))
            .unwrap();
        harness
            .assert_field_equals(SERVER_STATUS, "status", &Value::from("online"))
            .unwrap();
        assert_eq!(harness.get_stats().total_messages, 1);
    }

    #[tokio::test]
    async fn test_wait_for_status_times_out() {
        let harness = TestHarness::new();
        assert!(harness.wait_for_status(1, 50).await.is_none());
    }

    #[tokio::test]
    async fn test_wait_for_delayed_publish() {
        let harness = TestHarness::new();
        let bus = harness.bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let event = StatusEvent::new(4, ServerStatus::Offline);
            bus.publish(SERVER_STATUS, event.encode().unwrap()).await.unwrap();
        });

        let event = harness.wait_for_status(4, 1000).await.unwrap();
        assert_eq!(event.status, ServerStatus::Offline);
    }
}
