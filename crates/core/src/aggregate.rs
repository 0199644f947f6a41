//! Aggregate trait for event-sourced domain models.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::command::Command;
use crate::error::DomainResult;
use crate::event::Emitted;
use crate::id::AggregateId;
use crate::registry::EventRegistry;

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd)` returns the events to emit.
/// - **State mutation**: the functions registered in `registry()`, one per
///   event type, evolve state from a decoded event.
///
/// Aggregates must not perform IO or side effects. Versioning, history and
/// pending events are tracked by the infrastructure wrapper, not by the state
/// type itself.
///
/// The state is serializable so it can be captured in snapshots.
pub trait Aggregate:
    Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Command: Command;

    /// Stable aggregate type name, stored with every event and snapshot.
    const AGGREGATE_TYPE: &'static str;

    /// State before any event has been applied.
    fn initial(id: AggregateId) -> Self;

    /// Event-type to mutation mapping for this aggregate.
    fn registry() -> EventRegistry<Self>;

    /// Decide which events to emit given the current state and a command.
    ///
    /// This must not mutate state.
    fn handle(&self, command: &Self::Command) -> DomainResult<Vec<Emitted>>;
}
