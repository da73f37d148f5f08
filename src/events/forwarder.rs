//! Bridges synchronous callbacks to the async bus.
//!
//! Agent step callbacks run inside the agent loop and cannot await. They push
//! into an [`EventForwarder`], whose background task publishes in arrival
//! order. [`EventForwarder::finish`] drains it so callers can publish a
//! step's terminal marker strictly after its sub-events.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::bus::EventBus;
use super::types::PipelineEvent;

/// Ordered, non-blocking path from sync code onto an [`EventBus`].
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<PipelineEvent>,
    handle: JoinHandle<()>,
}

impl EventForwarder {
    /// Spawns the forwarding task.
    pub fn spawn(bus: Arc<EventBus>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PipelineEvent>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                bus.publish(event).await;
            }
        });
        Self { tx, handle }
    }

    /// Sender half to move into callbacks.
    pub fn sender(&self) -> mpsc::UnboundedSender<PipelineEvent> {
        self.tx.clone()
    }

    /// Waits until every event sent so far has been published.
    ///
    /// All clones of [`sender`](Self::sender) must be dropped first, otherwise
    /// this waits for them.
    pub async fn finish(self) {
        drop(self.tx);
        // The task only ends when the channel closes; a join error means it panicked.
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use serde_json::json;

    #[tokio::test]
    async fn test_finish_drains_in_order() {
        let bus = Arc::new(EventBus::in_memory());
        let forwarder = EventForwarder::spawn(Arc::clone(&bus));

        {
            let tx = forwarder.sender();
            for n in 0..5 {
                tx.send(PipelineEvent::new(
                    EventType::SessionToolCall,
                    "s-1",
                    json!({ "n": n }),
                ))
                .unwrap();
            }
        }
        forwarder.finish().await;
        bus.emit(EventType::SessionPlanReady, "s-1", json!({})).await;

        let events = bus.get_events("s-1").await.unwrap();
        assert_eq!(events.len(), 6);
        assert_eq!(events[4].data["n"], 4);
        assert_eq!(events[5].event_type, EventType::SessionPlanReady);
    }
}
