//! Queue-based delivery of scheduled commands.
//!
//! The scheduler enqueues one small message per scheduled command. Workers
//! receive those messages and ask the trigger engine to apply whatever is
//! due for the named aggregate. Messages are only completed once the record
//! is resolved; everything else goes back to the transport for redelivery.

mod adapter;
mod in_memory;
mod message;
#[cfg(feature = "redis")]
mod redis_streams;
mod transport;
mod worker;

pub use adapter::{CompletionReason, Disposition, QueueDeliveryAdapter, RedeliveryReason};
pub use in_memory::InMemoryQueue;
pub use message::{DeliveredMessage, ScheduledCommandMessage};
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsSettings, RedisStreamsTransport};
pub use transport::{QueueTransport, TransportError, TransportFault};
pub use worker::{DeliveryWorker, WorkerConfig, WorkerHandle};
