//! Append-only event persistence.

mod in_memory;
mod postgres;
mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub(crate) use postgres::is_unique_violation;
pub use r#trait::{
    ConcurrencyError, EventAuthorship, EventStore, EventStoreError, PendingEvent, StoredEvent,
    StreamRange, command_etag, event_etag,
};
