use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use chronicle_core::AggregateId;
use chronicle_events::EventEnvelope;

/// An event produced in memory, positioned but not yet persisted.
///
/// `sequence_number` is the position the event expects to occupy. The store
/// accepts it only if that position is still free, which is how concurrent
/// writers are detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub sequence_number: u64,

    pub event_type: String,
    /// Who caused the change. Named in concurrency errors.
    pub actor: Option<String>,
    /// Per-event idempotency token: the producing command's etag followed by
    /// `#` and the event's index among that command's events.
    pub etag: Option<String>,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl PendingEvent {
    pub fn authorship(&self) -> EventAuthorship {
        EventAuthorship {
            event_type: self.event_type.clone(),
            actor: self.actor.clone(),
        }
    }

    pub fn into_stored(self) -> StoredEvent {
        StoredEvent {
            event_id: self.event_id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            sequence_number: self.sequence_number,
            event_type: self.event_type,
            actor: self.actor,
            etag: self.etag,
            occurred_at: self.occurred_at,
            payload: self.payload,
        }
    }
}

/// An event in an append-only stream.
///
/// Sequence numbers are stream-scoped, start at 1, and never change once
/// assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub actor: Option<String>,
    pub etag: Option<String>,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn authorship(&self) -> EventAuthorship {
        EventAuthorship {
            event_type: self.event_type.clone(),
            actor: self.actor.clone(),
        }
    }

    /// Etag of the command that produced this event.
    pub fn command_etag(&self) -> Option<&str> {
        self.etag.as_deref().map(command_etag)
    }

    /// Convert a stored event into an envelope for publication.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.event_type.clone(),
            self.actor.clone(),
            self.occurred_at,
            self.payload.clone(),
        )
    }
}

/// Token stamped on the `index`-th event a command produces.
pub fn event_etag(command_etag: &str, index: usize) -> String {
    format!("{command_etag}#{index}")
}

/// The command etag an event token was derived from. Tokens without an index
/// suffix are returned unchanged.
pub fn command_etag(event_etag: &str) -> &str {
    match event_etag.rsplit_once('#') {
        Some((command, index)) if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) => {
            command
        }
        _ => event_etag,
    }
}

/// Which slice of a stream to read.
///
/// All bounds are inclusive except `after_sequence`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamRange {
    pub after_sequence: u64,
    pub max_sequence: Option<u64>,
    pub max_timestamp: Option<DateTime<Utc>>,
}

impl StreamRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn after(sequence_number: u64) -> Self {
        Self {
            after_sequence: sequence_number,
            ..Self::default()
        }
    }

    pub fn up_to_version(version: u64) -> Self {
        Self {
            max_sequence: Some(version),
            ..Self::default()
        }
    }

    pub fn as_of(at: DateTime<Utc>) -> Self {
        Self {
            max_timestamp: Some(at),
            ..Self::default()
        }
    }

    pub fn contains(&self, event: &StoredEvent) -> bool {
        event.sequence_number > self.after_sequence
            && self.max_sequence.is_none_or(|max| event.sequence_number <= max)
            && self.max_timestamp.is_none_or(|at| event.occurred_at <= at)
    }
}

/// Event type and author of one side of a write conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAuthorship {
    pub event_type: String,
    pub actor: Option<String>,
}

impl core::fmt::Display for EventAuthorship {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.actor {
            Some(actor) => write!(f, "'{}' by {}", self.event_type, actor),
            None => write!(f, "'{}' by an unknown actor", self.event_type),
        }
    }
}

/// Two writers raced for the same stream position.
///
/// `committed` is the change that won. It is `None` only when the store could
/// not read the winning row back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "concurrency conflict on aggregate {} at sequence {}: attempted {} but {} was already committed",
    .aggregate_id,
    .sequence_number,
    .attempted,
    committed_label(.committed)
)]
pub struct ConcurrencyError {
    pub aggregate_id: AggregateId,
    pub sequence_number: u64,
    pub attempted: EventAuthorship,
    pub committed: Option<EventAuthorship>,
}

fn committed_label(committed: &Option<EventAuthorship>) -> String {
    committed
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "another change".to_string())
}

/// Event store operation error.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error(transparent)]
    Conflict(#[from] ConcurrencyError),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Append-only event store.
///
/// Streams are keyed by aggregate id. The store is the single arbiter of who
/// committed first: `append` must insert a position only if it is absent.
///
/// Implementations must:
/// - persist a batch atomically (all events or none)
/// - reject a batch whose first position is already taken with
///   `EventStoreError::Conflict`, naming the committed event
/// - reject gaps and non-contiguous batches with `InvalidAppend`
/// - return events in ascending sequence order
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a contiguous batch of events for one aggregate.
    async fn append(&self, events: Vec<PendingEvent>) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Read a slice of one stream in sequence order. Missing streams read as empty.
    async fn read_stream(
        &self,
        aggregate_id: AggregateId,
        range: StreamRange,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Point lookup of one stream position.
    async fn find_event(
        &self,
        aggregate_id: AggregateId,
        sequence_number: u64,
    ) -> Result<Option<StoredEvent>, EventStoreError>;

    /// Highest committed sequence number (0 for a missing stream).
    async fn stream_version(&self, aggregate_id: AggregateId) -> Result<u64, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(&self, events: Vec<PendingEvent>) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events).await
    }

    async fn read_stream(
        &self,
        aggregate_id: AggregateId,
        range: StreamRange,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).read_stream(aggregate_id, range).await
    }

    async fn find_event(
        &self,
        aggregate_id: AggregateId,
        sequence_number: u64,
    ) -> Result<Option<StoredEvent>, EventStoreError> {
        (**self).find_event(aggregate_id, sequence_number).await
    }

    async fn stream_version(&self, aggregate_id: AggregateId) -> Result<u64, EventStoreError> {
        (**self).stream_version(aggregate_id).await
    }
}

/// Validate that a batch targets one stream with contiguous positions.
///
/// Returns `(aggregate_id, aggregate_type, first_sequence)`.
pub(crate) fn validate_batch(
    events: &[PendingEvent],
) -> Result<(AggregateId, String, u64), EventStoreError> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend("empty batch".to_string()));
    };
    if first.sequence_number == 0 {
        return Err(EventStoreError::InvalidAppend(
            "sequence numbers start at 1".to_string(),
        ));
    }

    for (idx, e) in events.iter().enumerate() {
        if e.aggregate_id != first.aggregate_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "batch contains multiple aggregate_ids (index {idx})"
            )));
        }
        if e.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "batch contains multiple aggregate_types (index {idx})"
            )));
        }
        if e.sequence_number != first.sequence_number + idx as u64 {
            return Err(EventStoreError::InvalidAppend(format!(
                "batch is not contiguous at index {idx}: expected sequence {}, got {}",
                first.sequence_number + idx as u64,
                e.sequence_number
            )));
        }
    }

    Ok((
        first.aggregate_id,
        first.aggregate_type.clone(),
        first.sequence_number,
    ))
}
