//! Cross-process event channel carrying worker progress to streaming
//! clients.
//!
//! Delivery is best-effort, fire-and-forget, multi-subscriber broadcast.
//! Authoritative state lives in the store; workers write DB state before
//! publishing, and subscribers that miss events reconstruct from the
//! `task:init` snapshot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;

/// Logical channel name on the out-of-process transport.
pub const CHANNEL: &str = "sse:events";

/// Broadcast capacity before lagged subscribers start dropping messages.
const LOCAL_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "image:generating")]
    ImageGenerating,
    #[serde(rename = "image:completed")]
    ImageCompleted,
    #[serde(rename = "image:failed")]
    ImageFailed,
    #[serde(rename = "model:generating")]
    ModelGenerating,
    #[serde(rename = "model:progress")]
    ModelProgress,
    #[serde(rename = "model:completed")]
    ModelCompleted,
    #[serde(rename = "model:failed")]
    ModelFailed,
    #[serde(rename = "task:updated")]
    TaskUpdated,
    #[serde(rename = "task:init")]
    TaskInit,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "error")]
    Error,
}

/// Wire envelope, serialized camelCase for streaming clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// The request id this event belongs to.
    pub task_id: String,
    pub event_type: EventType,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(task_id: &str, event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            task_id: task_id.to_string(),
            event_type,
            data,
        }
    }

    pub fn heartbeat(task_id: &str) -> Self {
        Self::new(
            task_id,
            EventType::Heartbeat,
            json!({ "timestamp": chrono::Utc::now().to_rfc3339() }),
        )
    }

    pub fn task_updated(task_id: &str, status: &str, phase: &str) -> Self {
        Self::new(
            task_id,
            EventType::TaskUpdated,
            json!({ "requestId": task_id, "status": status, "phase": phase }),
        )
    }
}

/// The publish/subscribe contract the core consumes. The shipped `LocalBus`
/// serves one process; a cross-process backend (e.g. a Redis channel named
/// `sse:events`) implements the same trait so workers on one host reach
/// subscribers on another.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Fire-and-forget publish. Failures are the implementation's to log;
    /// workers never fail a job because an event did not go out.
    async fn publish(&self, event: Envelope);

    fn subscribe(&self) -> broadcast::Receiver<Envelope>;
}

/// In-process bus over `tokio::sync::broadcast`.
pub struct LocalBus {
    tx: broadcast::Sender<Envelope>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self { tx }
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn publish(&self, event: Envelope) {
        // Send only errors when there are no subscribers: not a fault.
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_form_is_camel_case() {
        let env = Envelope::new(
            "req-1",
            EventType::ImageCompleted,
            json!({ "imageId": "img-1", "index": 2 }),
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["taskId"], "req-1");
        assert_eq!(value["eventType"], "image:completed");
        assert_eq!(value["data"]["imageId"], "img-1");
    }

    #[tokio::test]
    async fn local_bus_broadcasts_to_all_subscribers() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Envelope::heartbeat("req-1")).await;

        assert_eq!(a.recv().await.unwrap().task_id, "req-1");
        assert_eq!(b.recv().await.unwrap().task_id, "req-1");
    }
}
