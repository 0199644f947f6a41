//! Durable command scheduling.
//!
//! ## Components
//!
//! - `ScheduledCommand`: a command intent keyed by (aggregate, reserved sequence number)
//! - `ScheduledCommandStore`: persistence with conditional terminal transitions
//! - `CommandScheduler`: reserves positions, persists, and enqueues delivery messages
//! - `CommandTriggerEngine`: applies due records and does the retry bookkeeping
//!
//! ## Lifecycle
//!
//! `Scheduled` → `Applied` | `PermanentlyFailed`, or back to `Scheduled` with a
//! later due time after a retryable rejection. Terminal markers never change.

mod policy;
mod postgres;
mod scheduler;
mod store;
mod trigger;
mod types;

pub use policy::{BackoffStrategy, RetryPolicy, SchedulingPolicy};
pub use postgres::PostgresScheduledCommandStore;
pub use scheduler::{CommandScheduler, ScheduleRequest, SchedulingError};
pub use store::{InMemoryScheduledCommandStore, ScheduleStoreError, ScheduledCommandStore};
pub use trigger::{
    ApplyError, CommandApplier, CommandTriggerEngine, RepositoryApplier, SCHEDULER_ACTOR,
    TriggerError,
};
pub use types::{
    CommandFailure, CommandState, DeliveryPrecondition, FailureKind, ScheduledCommand,
    ScheduledCommandKey, TriggerResult, TriggerSelector,
};
