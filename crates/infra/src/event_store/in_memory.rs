use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use chronicle_core::AggregateId;

use super::r#trait::{
    ConcurrencyError, EventStore, EventStoreError, PendingEvent, StoredEvent, StreamRange,
    validate_batch,
};

/// In-memory append-only event store.
///
/// Intended for tests/dev. The write lock makes "insert if absent" atomic per
/// batch, matching the unique key a durable store would enforce.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<AggregateId, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    /// Total events across all streams.
    pub fn event_count(&self) -> usize {
        self.streams
            .read()
            .map(|s| s.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<PendingEvent>) -> Result<Vec<StoredEvent>, EventStoreError> {
        let (aggregate_id, aggregate_type, first_sequence) = validate_batch(&events)?;

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let stream = streams.entry(aggregate_id).or_default();
        let current = Self::current_version(stream);

        if first_sequence <= current {
            // Positions are contiguous from 1, so position n lives at index n - 1.
            let committed = stream
                .get((first_sequence - 1) as usize)
                .map(StoredEvent::authorship);
            return Err(ConcurrencyError {
                aggregate_id,
                sequence_number: first_sequence,
                attempted: events[0].authorship(),
                committed,
            }
            .into());
        }
        if first_sequence > current + 1 {
            return Err(EventStoreError::InvalidAppend(format!(
                "gap in stream {aggregate_id}: current version {current}, batch starts at {first_sequence}"
            )));
        }

        if let Some(existing) = stream.first() {
            if existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        let committed: Vec<StoredEvent> = events.into_iter().map(PendingEvent::into_stored).collect();
        stream.extend(committed.iter().cloned());

        Ok(committed)
    }

    async fn read_stream(
        &self,
        aggregate_id: AggregateId,
        range: StreamRange,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        Ok(streams
            .get(&aggregate_id)
            .map(|stream| stream.iter().filter(|e| range.contains(e)).cloned().collect())
            .unwrap_or_default())
    }

    async fn find_event(
        &self,
        aggregate_id: AggregateId,
        sequence_number: u64,
    ) -> Result<Option<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        Ok(streams.get(&aggregate_id).and_then(|stream| {
            stream
                .iter()
                .find(|e| e.sequence_number == sequence_number)
                .cloned()
        }))
    }

    async fn stream_version(&self, aggregate_id: AggregateId) -> Result<u64, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        Ok(streams
            .get(&aggregate_id)
            .map(|s| Self::current_version(s))
            .unwrap_or(0))
    }
}
