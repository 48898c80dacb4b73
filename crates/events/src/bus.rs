//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] fans out [`PipelineEvent`]s to the control plane and to
//! tests. It is shared via `Arc<EventBus>` across the pipeline actors.

use chrono::{DateTime, Utc};
use packline_core::types::DbId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// PipelineEvent
// ---------------------------------------------------------------------------

/// Something notable that happened in the pipeline.
///
/// Constructed via [`PipelineEvent::new`] and enriched with
/// [`with_item`](PipelineEvent::with_item),
/// [`with_worker`](PipelineEvent::with_worker) and
/// [`with_payload`](PipelineEvent::with_payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Dot-separated event name, e.g. `"item.reclaimed"`. See
    /// `packline_core::pipeline_events` for the full list.
    pub event_type: String,

    /// Queue item the event concerns, if any.
    pub item_id: Option<DbId>,

    /// Worker identity involved, if any.
    pub worker: Option<String>,

    /// Event-specific data.
    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            item_id: None,
            worker: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_item(mut self, item_id: DbId) -> Self {
        self.item_id = Some(item_id);
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// ```rust
/// use packline_events::bus::{EventBus, PipelineEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(PipelineEvent::new("scan.completed"));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// Slow receivers that fall more than `capacity` events behind observe
    /// `RecvError::Lagged` and lose the oldest events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: PipelineEvent) {
        // Ignore the SendError: it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let event = PipelineEvent::new("item.claimed")
            .with_item(42)
            .with_worker("node-a/worker-1")
            .with_payload(serde_json::json!({"attempt": 1}));
        bus.publish(event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "item.claimed");
        assert_eq!(received.item_id, Some(42));
        assert_eq!(received.worker.as_deref(), Some("node-a/worker-1"));
        assert_eq!(received.payload["attempt"], 1);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(PipelineEvent::new("pool.resized"));

        assert_eq!(a.recv().await.unwrap().event_type, "pool.resized");
        assert_eq!(b.recv().await.unwrap().event_type, "pool.resized");
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(PipelineEvent::new("scan.completed"));
    }

    #[test]
    fn new_event_has_empty_payload() {
        let event = PipelineEvent::new("events.synthesized");
        assert!(event.item_id.is_none());
        assert!(event.worker.is_none());
        assert_eq!(event.payload, serde_json::json!({}));
    }

    #[tokio::test]
    async fn lagging_receiver_gets_lagged_error() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(PipelineEvent::new("item.completed"));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
