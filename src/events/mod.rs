//! Event bus: live pub/sub plus a durable, replayable log.
//!
//! # Architecture
//!
//! - **EventBroadcaster**: in-memory fan-out to subscribers, no persistence
//! - **EventStore**: append-only storage keyed by correlation id
//!   ([`JsonlEventStore`] on disk, [`MemoryEventStore`] in process)
//! - **EventBus**: thin facade publishing to both, serialized per bus
//! - **EventForwarder**: ordered bridge from synchronous callbacks to the bus
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use swe_conductor::events::{EventBus, EventType, JsonlEventStore};
//!
//! let bus = EventBus::new(Arc::new(JsonlEventStore::new("./events")));
//! let (_id, mut rx) = bus.subscribe_channel();
//! bus.emit(EventType::PipelineAccepted, "req-1", serde_json::json!({})).await;
//!
//! // Later, possibly from another process:
//! let history = bus.get_events("req-1").await?;
//! ```

pub mod broadcaster;
pub mod bus;
pub mod forwarder;
pub mod store;
pub mod types;

pub use broadcaster::{EventBroadcaster, EventHandler, SubscriptionId};
pub use bus::EventBus;
pub use forwarder::EventForwarder;
pub use store::{EventStore, JsonlEventStore, MemoryEventStore};
pub use types::{EventType, PipelineEvent};
