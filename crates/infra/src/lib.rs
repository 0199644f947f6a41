//! Infrastructure layer: event and snapshot stores, the event-sourced
//! repository, command scheduling, and queue delivery.

pub mod aggregate;
pub mod config;
pub mod delivery;
pub mod event_store;
pub mod rehydrate;
pub mod repository;
pub mod schema;
pub mod scheduling;
pub mod snapshot;

#[cfg(test)]
mod test_fixtures;

pub use aggregate::{CommandContext, EventSourced, ReplayOutcome};
pub use config::DeliveryConfig;
pub use rehydrate::{RehydrationBound, Rehydrator};
pub use repository::{Consequence, EventSourcedRepository, RepositoryError, SaveScope};
