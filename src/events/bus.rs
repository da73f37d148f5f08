//! Event bus facade: broadcaster + durable store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, trace};

use super::broadcaster::{EventBroadcaster, EventHandler, SubscriptionId};
use super::store::{EventStore, MemoryEventStore};
use super::types::{EventType, PipelineEvent};
use crate::error::EventLogError;

/// Publishes events to live subscribers and appends them to the durable log.
///
/// Publishes are serialized: the notify + append pair of one event never
/// interleaves with another publish, so subscribers and the log observe the
/// same order.
///
/// Subscriber notification runs first. When the durable append fails the
/// event has still reached live subscribers; the failure is logged and counted
/// in [`EventBus::persist_failures`], and the append is not retried.
pub struct EventBus {
    broadcaster: EventBroadcaster,
    store: Arc<dyn EventStore>,
    publish_lock: Mutex<()>,
    persist_failures: AtomicU64,
}

impl EventBus {
    /// Creates a bus persisting to `store`.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            broadcaster: EventBroadcaster::new(),
            store,
            publish_lock: Mutex::new(()),
            persist_failures: AtomicU64::new(0),
        }
    }

    /// Bus backed by process memory only.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryEventStore::new()))
    }

    /// Publishes one event.
    pub async fn publish(&self, event: PipelineEvent) {
        let _guard = self.publish_lock.lock().await;

        trace!(event_type = %event.event_type, request_id = %event.request_id, "Publishing event");
        self.broadcaster.notify(&event);

        if let Err(err) = self.store.append(&event).await {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                event_type = %event.event_type,
                request_id = %event.request_id,
                error = %err,
                "Failed to persist event"
            );
        }
    }

    /// Builds and publishes an event.
    pub async fn emit(&self, event_type: EventType, correlation_id: &str, data: Value) {
        self.publish(PipelineEvent::new(event_type, correlation_id, data))
            .await;
    }

    /// Registers a synchronous handler for future events.
    pub fn subscribe(&self, handler: EventHandler) -> SubscriptionId {
        self.broadcaster.subscribe(handler)
    }

    /// Registers a channel subscriber for future events.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<PipelineEvent>) {
        self.broadcaster.subscribe_channel()
    }

    /// Removes a subscriber.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.broadcaster.unsubscribe(id)
    }

    /// Full persisted history of `correlation_id`, read from the store.
    pub async fn get_events(&self, correlation_id: &str) -> Result<Vec<PipelineEvent>, EventLogError> {
        self.store.read(correlation_id).await
    }

    /// Releases the store's resources for a finished correlation id.
    ///
    /// Waits for any in-flight publish, so a terminal event emitted just
    /// before is already on disk.
    pub async fn close(&self, correlation_id: &str) {
        let _guard = self.publish_lock.lock().await;
        self.store.close(correlation_id).await;
    }

    /// Number of events whose durable append failed.
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::JsonlEventStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct FailingStore;

    #[async_trait]
    impl EventStore for FailingStore {
        async fn append(&self, _event: &PipelineEvent) -> Result<(), EventLogError> {
            Err(EventLogError::Io(std::io::Error::other("disk full")))
        }

        async fn read(&self, _id: &str) -> Result<Vec<PipelineEvent>, EventLogError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_publish_notifies_and_persists() {
        let bus = EventBus::in_memory();
        let (_id, mut rx) = bus.subscribe_channel();

        bus.emit(EventType::PipelineAccepted, "req-1", json!({})).await;
        bus.emit(EventType::PipelineStarted, "req-1", json!({})).await;

        assert_eq!(rx.recv().await.unwrap().event_type, EventType::PipelineAccepted);
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::PipelineStarted);

        let history = bus.get_events("req-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, EventType::PipelineAccepted);
    }

    #[tokio::test]
    async fn test_persist_failure_still_delivers() {
        let bus = EventBus::new(Arc::new(FailingStore));
        let (_id, mut rx) = bus.subscribe_channel();

        bus.emit(EventType::PipelineAccepted, "req-1", json!({})).await;

        assert_eq!(rx.recv().await.unwrap().request_id, "req-1");
        assert_eq!(bus.persist_failures(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_publishers_keep_log_and_subscriber_order_equal() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(Arc::new(JsonlEventStore::new(dir.path()))));
        let (_id, mut rx) = bus.subscribe_channel();

        let mut handles = Vec::new();
        for worker in 0..4 {
            let bus = Arc::clone(&bus);
            handles.push(tokio::spawn(async move {
                for n in 0..10 {
                    bus.emit(
                        EventType::PipelineAgentStep,
                        "shared",
                        json!({ "worker": worker, "n": n }),
                    )
                    .await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut delivered = Vec::new();
        while let Ok(event) = rx.try_recv() {
            delivered.push(event.data);
        }
        let persisted: Vec<Value> = bus
            .get_events("shared")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.data)
            .collect();
        assert_eq!(delivered.len(), 40);
        assert_eq!(delivered, persisted);
    }

    #[tokio::test]
    async fn test_fresh_bus_replays_durable_history() {
        let dir = tempfile::tempdir().unwrap();
        {
            let bus = EventBus::new(Arc::new(JsonlEventStore::new(dir.path())));
            for kind in [
                EventType::PipelineAccepted,
                EventType::PipelineTierClassified,
                EventType::PipelineStarted,
                EventType::PipelineCompleted,
            ] {
                bus.emit(kind, "req-9", json!({})).await;
            }
        }

        let original = EventBus::new(Arc::new(JsonlEventStore::new(dir.path())));
        let first = original.get_events("req-9").await.unwrap();
        let second = EventBus::new(Arc::new(JsonlEventStore::new(dir.path())))
            .get_events("req-9")
            .await
            .unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first, second);
        assert_eq!(first[3].event_type, EventType::PipelineCompleted);
    }
}
