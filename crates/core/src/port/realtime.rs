// Realtime Publisher Port - fire-and-forget fan-out to topic subscribers

use serde::Serialize;
use serde_json::Value;

/// One event delivered to every current subscriber of a topic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeEvent {
    pub topic: String,
    pub name: String,
    pub payload: Value,
}

impl RealtimeEvent {
    pub fn new(topic: impl Into<String>, name: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            name: name.into(),
            payload,
        }
    }
}

/// Realtime fan-out port
///
/// No delivery guarantee: subscribers that are not connected at publish
/// time never see the event.
#[cfg_attr(test, mockall::automock)]
pub trait RealtimePublisher: Send + Sync {
    /// Publish an event, returning how many subscribers received it
    fn publish(&self, event: RealtimeEvent) -> usize;
}
