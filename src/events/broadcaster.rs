//! In-memory subscriber fan-out, no persistence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use super::types::PipelineEvent;

/// Callback invoked for every event published after registration.
pub type EventHandler = Arc<dyn Fn(&PipelineEvent) + Send + Sync>;

/// Handle returned by [`EventBroadcaster::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Synchronous fan-out to registered handlers in registration order.
#[derive(Default)]
pub struct EventBroadcaster {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(SubscriptionId, EventHandler)>>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler. It only sees events notified after this call.
    pub fn subscribe(&self, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push((id, handler)),
            Err(poisoned) => poisoned.into_inner().push((id, handler)),
        }
        id
    }

    /// Registers a channel-backed subscriber for async consumers.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(Arc::new(move |event: &PipelineEvent| {
            // A dropped receiver just stops listening.
            let _ = tx.send(event.clone());
        }));
        (id, rx)
    }

    /// Removes a handler. Returns false when the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = match self.handlers.write() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Number of registered handlers.
    pub fn subscriber_count(&self) -> usize {
        match self.handlers.read() {
            Ok(handlers) => handlers.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Delivers `event` to every handler in registration order.
    ///
    /// A panicking handler is logged and skipped; later handlers still run.
    pub fn notify(&self, event: &PipelineEvent) {
        // Snapshot so handlers may subscribe/unsubscribe without deadlocking.
        let handlers: Vec<EventHandler> = match self.handlers.read() {
            Ok(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(_, h)| Arc::clone(h))
                .collect(),
        };

        for handler in handlers {
            let outcome =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event)));
            if outcome.is_err() {
                warn!(
                    event_type = %event.event_type,
                    request_id = %event.request_id,
                    "Event subscriber panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use std::sync::Mutex;

    fn event(id: &str) -> PipelineEvent {
        PipelineEvent::new(EventType::PipelineStarted, id, serde_json::json!({}))
    }

    #[test]
    fn test_notify_in_registration_order() {
        let broadcaster = EventBroadcaster::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            broadcaster.subscribe(Arc::new(move |_e: &PipelineEvent| {
                seen.lock().unwrap().push(name);
            }));
        }

        broadcaster.notify(&event("r1"));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_no_replay_on_subscribe() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.notify(&event("before"));

        let (_id, mut rx) = broadcaster.subscribe_channel();
        broadcaster.notify(&event("after"));

        assert_eq!(rx.try_recv().unwrap().request_id, "after");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let broadcaster = EventBroadcaster::new();
        let (id, mut rx) = broadcaster.subscribe_channel();
        assert_eq!(broadcaster.subscriber_count(), 1);

        assert!(broadcaster.unsubscribe(id));
        assert!(!broadcaster.unsubscribe(id));
        broadcaster.notify(&event("r1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.subscribe(Arc::new(|_e: &PipelineEvent| panic!("boom")));
        let (_id, mut rx) = broadcaster.subscribe_channel();

        broadcaster.notify(&event("r1"));
        assert_eq!(rx.try_recv().unwrap().request_id, "r1");
    }
}
