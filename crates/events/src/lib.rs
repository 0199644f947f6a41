//! Committed-event envelopes and pub/sub mechanics.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
