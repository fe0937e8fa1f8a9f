use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::message::BusMessage;

/// Errors surfaced by an event bus publish attempt.
///
/// Publish failures are transient infrastructure errors; the publisher
/// records them on the outbox row and retries on a later poll.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus rejected or could not accept the message.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),
}

/// Publish/subscribe transport between services.
///
/// The transport guarantees at-least-once, not exactly-once, delivery:
/// consumers must dedupe on [`BusMessage::event_id`].
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes a message to its topic.
    async fn publish(&self, message: &BusMessage) -> Result<(), BusError>;
}

#[derive(Default)]
struct InProcessState {
    published: Vec<BusMessage>,
    fail_times: u32,
}

/// In-process event bus backed by a broadcast channel.
///
/// Used for single-process deployments and tests. Keeps a log of every
/// published message for inspection and supports injecting a number of
/// consecutive publish failures.
#[derive(Clone)]
pub struct InProcessBus {
    sender: broadcast::Sender<BusMessage>,
    state: Arc<Mutex<InProcessState>>,
}

impl InProcessBus {
    /// Creates a bus with the given subscriber channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            state: Arc::new(Mutex::new(InProcessState::default())),
        }
    }

    /// Subscribes to every message published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    /// Makes the next `n` publish attempts fail.
    pub fn set_fail_times(&self, n: u32) {
        self.state.lock().unwrap().fail_times = n;
    }

    /// Returns every message published so far, in publish order.
    pub fn published(&self) -> Vec<BusMessage> {
        self.state.lock().unwrap().published.clone()
    }

    /// Returns published messages addressed to a topic, in publish order.
    pub fn published_on(&self, topic: &str) -> Vec<BusMessage> {
        self.state
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    async fn publish(&self, message: &BusMessage) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_times > 0 {
            state.fail_times -= 1;
            return Err(BusError::Unavailable("injected failure".to_string()));
        }
        state.published.push(message.clone());
        drop(state);

        // A send error only means no live subscribers, which is fine.
        let _ = self.sender.send(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{EventId, Payload};

    fn message(topic: &str, key: &str) -> BusMessage {
        BusMessage {
            event_id: EventId::new(),
            topic: topic.to_string(),
            key: key.to_string(),
            payload: Payload::new(),
            saga_id: None,
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = InProcessBus::default();
        let mut rx = bus.subscribe();

        let msg = message("user-events", "user-1");
        bus.publish(&msg).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_id, msg.event_id);
        assert_eq!(received.topic, "user-events");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InProcessBus::default();
        bus.publish(&message("t", "k")).await.unwrap();
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn fail_times_injects_consecutive_failures() {
        let bus = InProcessBus::default();
        bus.set_fail_times(2);

        assert!(bus.publish(&message("t", "k")).await.is_err());
        assert!(bus.publish(&message("t", "k")).await.is_err());
        assert!(bus.publish(&message("t", "k")).await.is_ok());
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn published_on_filters_by_topic() {
        let bus = InProcessBus::default();
        bus.publish(&message("a", "k")).await.unwrap();
        bus.publish(&message("b", "k")).await.unwrap();
        bus.publish(&message("a", "k")).await.unwrap();

        assert_eq!(bus.published_on("a").len(), 2);
        assert_eq!(bus.published_on("b").len(), 1);
        assert!(bus.published_on("c").is_empty());
    }
}
