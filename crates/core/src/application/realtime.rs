// RealtimeHub - in-process topic fan-out over tokio broadcast channels

use crate::application::constants::REALTIME_TOPIC_CAPACITY;
use crate::port::{RealtimeEvent, RealtimePublisher};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::trace;

/// One broadcast channel per topic, created on first subscribe
pub struct RealtimeHub {
    topics: Mutex<HashMap<String, broadcast::Sender<RealtimeEvent>>>,
    capacity: usize,
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(REALTIME_TOPIC_CAPACITY)
    }
}

impl RealtimeHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Receive every event published on `topic` from now on
    ///
    /// A receiver that falls more than the topic capacity behind gets
    /// `RecvError::Lagged` and skips the oldest events.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<RealtimeEvent> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        match topics.get(topic) {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(self.capacity);
                topics.insert(topic.to_string(), tx);
                rx
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl RealtimePublisher for RealtimeHub {
    fn publish(&self, event: RealtimeEvent) -> usize {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = topics.get(&event.topic) else {
            return 0;
        };

        let topic = event.topic.clone();
        match tx.send(event) {
            Ok(delivered) => {
                trace!(topic = %topic, delivered, "Realtime event published");
                delivered
            }
            Err(_) => {
                // Every subscriber is gone
                topics.remove(&topic);
                0
            }
        }
    }
}
