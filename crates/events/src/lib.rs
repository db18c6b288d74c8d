//! Ingested events and their distribution.
//!
//! - `event`: the immutable `Event` record and the `EventDraft` plugins return
//! - `bus`: pub/sub abstraction for handing persisted events to consumers
//! - `in_memory_bus`: channel-backed bus for tests and single-process setups

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{BusError, EventBus, SharedEventBus, Subscription};
pub use event::{
    Event, EventActor, EventDraft, EventMetadata, LinkHint, PlatformAccount,
};
pub use in_memory_bus::InMemoryEventBus;
