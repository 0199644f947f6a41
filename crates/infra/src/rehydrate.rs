//! Rebuilding aggregate instances from their event streams.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use chronicle_core::{Aggregate, AggregateId, EventRegistry};

use crate::aggregate::{EventSourced, ReplayOutcome};
use crate::event_store::{StoredEvent, StreamRange};
use crate::snapshot::Snapshot;

/// Upper bound on what a rehydration reflects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RehydrationBound {
    Latest,
    /// Every event with `sequence_number <= n`.
    Version(u64),
    /// Every event with `occurred_at <= t`.
    AsOf(DateTime<Utc>),
}

impl RehydrationBound {
    /// The stream slice to read for this bound, starting after `after_sequence`.
    pub fn range(&self, after_sequence: u64) -> StreamRange {
        let base = StreamRange::after(after_sequence);
        match *self {
            RehydrationBound::Latest => base,
            RehydrationBound::Version(v) => StreamRange {
                max_sequence: Some(v),
                ..base
            },
            RehydrationBound::AsOf(at) => StreamRange {
                max_timestamp: Some(at),
                ..base
            },
        }
    }

    /// Whether an instance reflecting events up to `version`, the last of
    /// which occurred at `last_event_at`, lies entirely within this bound.
    pub fn covers(&self, version: u64, last_event_at: Option<DateTime<Utc>>) -> bool {
        match *self {
            RehydrationBound::Latest => true,
            RehydrationBound::Version(v) => version <= v,
            RehydrationBound::AsOf(at) => version == 0 || last_event_at.is_some_and(|t| t <= at),
        }
    }
}

/// Replays events onto aggregate instances.
///
/// Holds the aggregate's registry so it is built once, not per load.
#[derive(Debug)]
pub struct Rehydrator<A: Aggregate> {
    registry: Arc<EventRegistry<A>>,
}

impl<A: Aggregate> Clone for Rehydrator<A> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<A: Aggregate> Default for Rehydrator<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> Rehydrator<A> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(A::registry()),
        }
    }

    /// An instance with no history, for commands that create the aggregate.
    pub fn empty(&self, id: AggregateId) -> EventSourced<A> {
        EventSourced::new(id, Arc::clone(&self.registry))
    }

    /// Seed an instance from a snapshot's serialized state.
    pub fn seed(&self, snapshot: &Snapshot) -> Result<EventSourced<A>, serde_json::Error> {
        EventSourced::from_snapshot(snapshot, Arc::clone(&self.registry))
    }

    /// Rebuild an aggregate from `events`, optionally starting from `seed`.
    ///
    /// Events at or below the seed's version, and events outside `bound`, are
    /// ignored, so callers may pass an unfiltered stream. A seed that reflects
    /// anything beyond `bound` is discarded and the stream replayed from the
    /// start, so `events` must then hold the full stream. Returns `None` when
    /// nothing was reflected: no usable seed and no event within the bound.
    pub fn rehydrate<I>(
        &self,
        id: AggregateId,
        seed: Option<EventSourced<A>>,
        events: I,
        bound: RehydrationBound,
    ) -> Option<EventSourced<A>>
    where
        I: IntoIterator<Item = StoredEvent>,
    {
        let seed = seed.filter(|seed| {
            let usable = bound.covers(seed.committed_version(), seed.last_event_at());
            if !usable {
                debug!(
                    aggregate_id = %id,
                    seed_version = seed.committed_version(),
                    ?bound,
                    "seed reaches past the bound; replaying from the start"
                );
            }
            usable
        });
        let seeded = seed.is_some();
        let mut aggregate = seed.unwrap_or_else(|| self.empty(id));
        let range = bound.range(aggregate.committed_version());

        let replayed = self.catch_up(&mut aggregate, events.into_iter().filter(|e| range.contains(e)));

        if !seeded && replayed == 0 {
            return None;
        }
        Some(aggregate)
    }

    /// Fold events newer than the instance's version into it, in order.
    ///
    /// Returns how many events were folded in (including skipped ones).
    pub fn catch_up<I>(&self, aggregate: &mut EventSourced<A>, events: I) -> usize
    where
        I: IntoIterator<Item = StoredEvent>,
    {
        let mut events: Vec<StoredEvent> = events
            .into_iter()
            .filter(|e| e.sequence_number > aggregate.committed_version())
            .collect();
        events.sort_by_key(|e| e.sequence_number);

        let mut folded = 0;
        for event in events {
            let sequence_number = event.sequence_number;
            let event_type = event.event_type.clone();
            match aggregate.replay(event) {
                ReplayOutcome::Applied => {}
                ReplayOutcome::AppliedPartially { ignored_fields } => debug!(
                    aggregate_id = %aggregate.id(),
                    sequence_number,
                    event_type = %event_type,
                    ?ignored_fields,
                    "applied event with members that no longer decode"
                ),
                ReplayOutcome::AlreadyReflected => debug!(
                    aggregate_id = %aggregate.id(),
                    sequence_number,
                    event_type = %event_type,
                    "event already reflected by snapshot"
                ),
                ReplayOutcome::Skipped { reason } => warn!(
                    aggregate_id = %aggregate.id(),
                    sequence_number,
                    event_type = %event_type,
                    reason = %reason,
                    "skipping event that cannot be applied"
                ),
            }
            folded += 1;
        }
        folded
    }
}
