//! `chronicle-core`: event-sourcing building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod clock;
pub mod command;
pub mod decode;
pub mod error;
pub mod event;
pub mod id;
pub mod registry;

pub use aggregate::Aggregate;
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::Command;
pub use decode::{DecodeError, Decoded, decode_lenient};
pub use error::{DomainError, DomainResult};
pub use event::{Emitted, Event};
pub use id::AggregateId;
pub use registry::{ApplyOutcome, EventRegistry};
