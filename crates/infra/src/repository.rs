//! Event-sourced aggregate repository.
//!
//! Coordinates rehydration, concurrency-checked persistence, and refresh of live
//! aggregate instances. The pipeline for `save` is:
//!
//! ```text
//! pending events → EventStore::append → mark committed → publish (in order)
//!                                                       → consequences
//! ```
//!
//! Nothing is published unless the append committed. A conflict at the store
//! surfaces as `RepositoryError::Concurrency` and is never retried here: the
//! caller reloads and decides again.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use chronicle_core::{Aggregate, AggregateId, Clock};
use chronicle_events::{EventBus, EventEnvelope};

use crate::aggregate::{CommandContext, EventSourced};
use crate::event_store::{ConcurrencyError, EventStore, EventStoreError, StoredEvent, StreamRange};
use crate::rehydrate::{RehydrationBound, Rehydrator};
use crate::snapshot::{Snapshot, SnapshotStore, SnapshotStoreError};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Concurrency(ConcurrencyError),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("event store error: {0}")]
    Store(EventStoreError),

    #[error("snapshot store error: {0}")]
    Snapshot(#[from] SnapshotStoreError),

    #[error("aggregate state could not be snapshotted: {0}")]
    SnapshotState(String),

    /// The events are durable; only their publication failed.
    #[error("events committed but publication failed: {0}")]
    Publish(String),
}

impl From<EventStoreError> for RepositoryError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Conflict(conflict) => RepositoryError::Concurrency(conflict),
            other => RepositoryError::Store(other),
        }
    }
}

/// Handler run synchronously, in-process, after each committed event of a save.
///
/// Consequences see the just-saved instance through the [`SaveScope`] instead
/// of reloading it. Failures are logged; the save has already committed.
#[async_trait]
pub trait Consequence<A: Aggregate>: Send + Sync {
    async fn on_committed(&self, event: &StoredEvent, scope: &SaveScope<'_, A>) -> anyhow::Result<()>;
}

/// Instances saved by the current `save` call, keyed by aggregate id.
///
/// Lives only for the duration of the save.
#[derive(Debug)]
pub struct SaveScope<'a, A: Aggregate> {
    saved: &'a EventSourced<A>,
}

impl<'a, A: Aggregate> SaveScope<'a, A> {
    fn new(saved: &'a EventSourced<A>) -> Self {
        Self { saved }
    }

    /// The in-memory instance for `id`, if this save produced it.
    pub fn aggregate(&self, id: AggregateId) -> Option<&'a EventSourced<A>> {
        (self.saved.id() == id).then_some(self.saved)
    }

    pub fn saved(&self) -> &'a EventSourced<A> {
        self.saved
    }
}

pub struct EventSourcedRepository<A, S, B>
where
    A: Aggregate,
{
    store: S,
    bus: B,
    clock: Arc<dyn Clock>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    consequences: Vec<Arc<dyn Consequence<A>>>,
    rehydrator: Rehydrator<A>,
}

impl<A, S, B> core::fmt::Debug for EventSourcedRepository<A, S, B>
where
    A: Aggregate,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventSourcedRepository")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("snapshots", &self.snapshots.is_some())
            .field("consequences", &self.consequences.len())
            .finish()
    }
}

impl<A, S, B> EventSourcedRepository<A, S, B>
where
    A: Aggregate,
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(store: S, bus: B, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            bus,
            clock,
            snapshots: None,
            consequences: Vec::new(),
            rehydrator: Rehydrator::new(),
        }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_consequence(mut self, consequence: Arc<dyn Consequence<A>>) -> Self {
        self.consequences.push(consequence);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Command context stamped with the repository clock's current time.
    pub fn context(&self) -> CommandContext {
        CommandContext::at(self.clock.now())
    }

    /// A new, empty instance (version 0) for commands that create the aggregate.
    pub fn create(&self, id: AggregateId) -> EventSourced<A> {
        self.rehydrator.empty(id)
    }

    /// Latest state: newest usable snapshot plus every event after it.
    ///
    /// A snapshot that no longer deserializes is ignored in favour of a full
    /// replay.
    #[instrument(skip(self), fields(aggregate_type = A::AGGREGATE_TYPE), err)]
    pub async fn get_latest(&self, id: AggregateId) -> Result<Option<EventSourced<A>>, RepositoryError> {
        let seed = self.load_seed(id).await?;
        let after = seed.as_ref().map(|s| s.committed_version()).unwrap_or(0);

        let events = self.store.read_stream(id, StreamRange::after(after)).await?;
        Ok(self
            .rehydrator
            .rehydrate(id, seed, events, RehydrationBound::Latest))
    }

    /// State after exactly `version` events. `None` if the stream is shorter.
    #[instrument(skip(self), fields(aggregate_type = A::AGGREGATE_TYPE), err)]
    pub async fn get_version(
        &self,
        id: AggregateId,
        version: u64,
    ) -> Result<Option<EventSourced<A>>, RepositoryError> {
        let bound = RehydrationBound::Version(version);
        let events = self.store.read_stream(id, bound.range(0)).await?;
        Ok(self
            .rehydrator
            .rehydrate(id, None, events, bound)
            .filter(|aggregate| aggregate.version() == version))
    }

    /// State reflecting only events that occurred at or before `at`.
    #[instrument(skip(self), fields(aggregate_type = A::AGGREGATE_TYPE), err)]
    pub async fn get_as_of_date(
        &self,
        id: AggregateId,
        at: DateTime<Utc>,
    ) -> Result<Option<EventSourced<A>>, RepositoryError> {
        let bound = RehydrationBound::AsOf(at);
        let events = self.store.read_stream(id, bound.range(0)).await?;
        Ok(self.rehydrator.rehydrate(id, None, events, bound))
    }

    /// Persist pending events, then publish them in sequence order.
    ///
    /// Returns the committed events (empty when there was nothing to save).
    #[instrument(
        skip(self, aggregate),
        fields(aggregate_id = %aggregate.id(), pending = aggregate.pending().len()),
        err
    )]
    pub async fn save(&self, aggregate: &mut EventSourced<A>) -> Result<Vec<StoredEvent>, RepositoryError> {
        if !aggregate.has_pending() {
            return Ok(Vec::new());
        }

        let committed = match self.store.append(aggregate.pending().to_vec()).await {
            Ok(committed) => committed,
            Err(EventStoreError::Conflict(conflict)) => {
                info!(aggregate_id = %aggregate.id(), "{conflict}");
                return Err(RepositoryError::Concurrency(conflict));
            }
            Err(other) => return Err(other.into()),
        };
        aggregate.mark_committed(committed.clone());

        let mut publish_failure = None;
        for event in &committed {
            if let Err(e) = self.bus.publish(event.to_envelope()) {
                error!(
                    aggregate_id = %event.aggregate_id,
                    sequence_number = event.sequence_number,
                    error = ?e,
                    "failed to publish committed event"
                );
                publish_failure.get_or_insert_with(|| {
                    format!("sequence {}: {e:?}", event.sequence_number)
                });
            }
        }

        if !self.consequences.is_empty() {
            let scope = SaveScope::new(aggregate);
            for event in &committed {
                for consequence in &self.consequences {
                    if let Err(e) = consequence.on_committed(event, &scope).await {
                        warn!(
                            aggregate_id = %event.aggregate_id,
                            sequence_number = event.sequence_number,
                            error = %e,
                            "consequence handler failed"
                        );
                    }
                }
            }
        }

        match publish_failure {
            Some(failure) => Err(RepositoryError::Publish(failure)),
            None => Ok(committed),
        }
    }

    /// Apply events committed since the instance was loaded.
    ///
    /// Fails with `InvalidOperation` when the instance holds unsaved events.
    pub async fn refresh(&self, aggregate: &mut EventSourced<A>) -> Result<usize, RepositoryError> {
        if aggregate.has_pending() {
            return Err(RepositoryError::InvalidOperation(format!(
                "cannot refresh {} {} with {} unsaved event(s)",
                A::AGGREGATE_TYPE,
                aggregate.id(),
                aggregate.pending().len()
            )));
        }

        let events = self
            .store
            .read_stream(aggregate.id(), StreamRange::after(aggregate.committed_version()))
            .await?;
        Ok(self.rehydrator.catch_up(aggregate, events))
    }

    /// Write a snapshot of a saved instance.
    pub async fn take_snapshot(&self, aggregate: &EventSourced<A>) -> Result<Snapshot, RepositoryError> {
        let Some(snapshots) = &self.snapshots else {
            return Err(RepositoryError::InvalidOperation(
                "no snapshot store configured".to_string(),
            ));
        };
        if aggregate.has_pending() {
            return Err(RepositoryError::InvalidOperation(format!(
                "cannot snapshot {} {} with unsaved events",
                A::AGGREGATE_TYPE,
                aggregate.id()
            )));
        }
        if aggregate.committed_version() == 0 {
            return Err(RepositoryError::InvalidOperation(format!(
                "{} {} has no committed events",
                A::AGGREGATE_TYPE,
                aggregate.id()
            )));
        }

        let snapshot = aggregate
            .to_snapshot(self.clock.now())
            .map_err(|e| RepositoryError::SnapshotState(e.to_string()))?;
        snapshots.put(snapshot.clone()).await?;
        Ok(snapshot)
    }

    async fn load_seed(&self, id: AggregateId) -> Result<Option<EventSourced<A>>, RepositoryError> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(None);
        };
        let Some(snapshot) = snapshots.latest(id).await? else {
            return Ok(None);
        };

        if snapshot.aggregate_type != A::AGGREGATE_TYPE {
            warn!(
                aggregate_id = %id,
                snapshot_type = %snapshot.aggregate_type,
                expected = A::AGGREGATE_TYPE,
                "ignoring snapshot of a different aggregate type"
            );
            return Ok(None);
        }

        match self.rehydrator.seed(&snapshot) {
            Ok(seed) => Ok(Some(seed)),
            Err(e) => {
                warn!(
                    aggregate_id = %id,
                    version = snapshot.version,
                    error = %e,
                    "snapshot state no longer deserializes; replaying from the start"
                );
                Ok(None)
            }
        }
    }
}
