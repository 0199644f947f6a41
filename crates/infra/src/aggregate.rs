//! Live aggregate instances.
//!
//! `EventSourced<A>` wraps an aggregate's state with everything the repository
//! needs to persist it: the committed history, the events produced in memory
//! but not yet saved, and the idempotency tokens already reflected.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use chronicle_core::{Aggregate, AggregateId, ApplyOutcome, DomainError, DomainResult, EventRegistry};

use crate::event_store::{PendingEvent, StoredEvent, command_etag, event_etag};
use crate::snapshot::Snapshot;

/// Metadata stamped on the events a command produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub occurred_at: DateTime<Utc>,
    pub actor: Option<String>,
    /// Idempotency token. A command whose etag the aggregate already reflects
    /// produces no events.
    pub etag: Option<String>,
}

impl CommandContext {
    pub fn at(occurred_at: DateTime<Utc>) -> Self {
        Self {
            occurred_at,
            actor: None,
            etag: None,
        }
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

/// Result of replaying one committed event onto an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Applied,
    AppliedPartially { ignored_fields: Vec<String> },
    /// The snapshot this instance was seeded from already reflects the event's etag.
    AlreadyReflected,
    /// Unknown type or undecodable payload. Counted in the version, not applied.
    Skipped { reason: String },
}

#[derive(Debug, Clone)]
pub struct EventSourced<A: Aggregate> {
    id: AggregateId,
    state: A,
    committed_version: u64,
    last_event_at: Option<DateTime<Utc>>,
    snapshot_version: Option<u64>,
    history: Vec<StoredEvent>,
    pending: Vec<PendingEvent>,
    etags: HashSet<String>,
    snapshot_etags: BTreeSet<String>,
    registry: Arc<EventRegistry<A>>,
}

impl<A: Aggregate> EventSourced<A> {
    pub(crate) fn new(id: AggregateId, registry: Arc<EventRegistry<A>>) -> Self {
        Self {
            id,
            state: A::initial(id),
            committed_version: 0,
            last_event_at: None,
            snapshot_version: None,
            history: Vec::new(),
            pending: Vec::new(),
            etags: HashSet::new(),
            snapshot_etags: BTreeSet::new(),
            registry,
        }
    }

    pub(crate) fn from_snapshot(
        snapshot: &Snapshot,
        registry: Arc<EventRegistry<A>>,
    ) -> Result<Self, serde_json::Error> {
        let state: A = serde_json::from_value(snapshot.state.clone())?;
        Ok(Self {
            id: snapshot.aggregate_id,
            state,
            committed_version: snapshot.version,
            last_event_at: snapshot.last_event_at,
            snapshot_version: Some(snapshot.version),
            history: Vec::new(),
            pending: Vec::new(),
            etags: snapshot.etags.iter().map(|token| command_etag(token).to_string()).collect(),
            snapshot_etags: snapshot.etags.clone(),
            registry,
        })
    }

    pub fn id(&self) -> AggregateId {
        self.id
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    /// Sequence number of the latest event, committed or pending.
    pub fn version(&self) -> u64 {
        self.committed_version + self.pending.len() as u64
    }

    /// Sequence number of the latest committed event.
    pub fn committed_version(&self) -> u64 {
        self.committed_version
    }

    /// When the latest committed event occurred. `None` for a fresh instance,
    /// or one seeded from a snapshot that did not record it.
    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.last_event_at
    }

    /// Version of the snapshot this instance was seeded from, if any.
    pub fn snapshot_version(&self) -> Option<u64> {
        self.snapshot_version
    }

    /// Committed events replayed into this instance. When seeded from a
    /// snapshot, only the events after it.
    pub fn history(&self) -> &[StoredEvent] {
        &self.history
    }

    pub fn pending(&self) -> &[PendingEvent] {
        &self.pending
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn reflects(&self, etag: &str) -> bool {
        self.etags.contains(etag)
    }

    /// Decide and apply a command in memory.
    ///
    /// Returns the number of events produced. On rejection neither the state
    /// nor the pending events change.
    pub fn execute(&mut self, command: &A::Command, context: CommandContext) -> DomainResult<usize> {
        if let Some(etag) = context.etag.as_deref() {
            if self.reflects(etag) {
                debug!(aggregate_id = %self.id, etag, "command already reflected; nothing to do");
                return Ok(0);
            }
        }

        let emitted = self.state.handle(command)?;

        let mut next_state = self.state.clone();
        let mut staged = Vec::with_capacity(emitted.len());
        let mut sequence_number = self.version();
        for (index, event) in emitted.into_iter().enumerate() {
            match self.registry.apply(&mut next_state, &event.event_type, &event.payload) {
                ApplyOutcome::Applied | ApplyOutcome::AppliedPartially { .. } => {}
                ApplyOutcome::UnknownType => {
                    return Err(DomainError::invariant(format!(
                        "{} emitted unregistered event type '{}'",
                        A::AGGREGATE_TYPE,
                        event.event_type
                    )));
                }
                ApplyOutcome::Undecodable(reason) => {
                    return Err(DomainError::invariant(format!(
                        "{} emitted '{}' that its own registry cannot decode: {reason}",
                        A::AGGREGATE_TYPE,
                        event.event_type
                    )));
                }
            }

            sequence_number += 1;
            staged.push(PendingEvent {
                event_id: Uuid::now_v7(),
                aggregate_id: self.id,
                aggregate_type: A::AGGREGATE_TYPE.to_string(),
                sequence_number,
                event_type: event.event_type,
                actor: context.actor.clone(),
                etag: context.etag.as_deref().map(|etag| event_etag(etag, index)),
                occurred_at: context.occurred_at,
                payload: event.payload,
            });
        }

        let produced = staged.len();
        if produced > 0 {
            if let Some(etag) = context.etag {
                self.etags.insert(etag);
            }
        }
        self.state = next_state;
        self.pending.extend(staged);
        Ok(produced)
    }

    /// Fold one committed event into the instance.
    ///
    /// The version always advances to the event's sequence number, even when
    /// the event cannot be applied, so later appends target the right position.
    /// An event is skipped as already reflected only when the seed snapshot
    /// holds its exact per-event token.
    pub(crate) fn replay(&mut self, event: StoredEvent) -> ReplayOutcome {
        let already_reflected = event
            .etag
            .as_deref()
            .is_some_and(|etag| self.snapshot_etags.contains(etag));

        let outcome = if already_reflected {
            ReplayOutcome::AlreadyReflected
        } else {
            match self.registry.apply(&mut self.state, &event.event_type, &event.payload) {
                ApplyOutcome::Applied => ReplayOutcome::Applied,
                ApplyOutcome::AppliedPartially { ignored_fields } => {
                    ReplayOutcome::AppliedPartially { ignored_fields }
                }
                ApplyOutcome::UnknownType => ReplayOutcome::Skipped {
                    reason: "unknown event type".to_string(),
                },
                ApplyOutcome::Undecodable(reason) => ReplayOutcome::Skipped { reason },
            }
        };

        if let Some(etag) = event.command_etag() {
            self.etags.insert(etag.to_string());
        }
        if event.sequence_number >= self.committed_version {
            self.committed_version = event.sequence_number;
            self.last_event_at = Some(event.occurred_at);
        }
        self.history.push(event);
        outcome
    }

    /// Move pending events into history once the store has accepted them.
    pub(crate) fn mark_committed(&mut self, committed: Vec<StoredEvent>) {
        if let Some(last) = committed.last() {
            self.committed_version = last.sequence_number;
            self.last_event_at = Some(last.occurred_at);
        }
        self.pending.clear();
        self.history.extend(committed);
    }

    pub(crate) fn to_snapshot(&self, created_at: DateTime<Utc>) -> Result<Snapshot, serde_json::Error> {
        Ok(Snapshot {
            aggregate_id: self.id,
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            version: self.committed_version,
            last_event_at: self.last_event_at,
            state: serde_json::to_value(&self.state)?,
            etags: self
                .snapshot_etags
                .iter()
                .cloned()
                .chain(self.history.iter().filter_map(|e| e.etag.clone()))
                .collect(),
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{Order, OrderCommand, at};

    fn fresh() -> EventSourced<Order> {
        EventSourced::new(AggregateId::new(), Arc::new(Order::registry()))
    }

    #[test]
    fn execute_stages_positioned_events() {
        let mut order = fresh();
        let produced = order
            .execute(&OrderCommand::add("sku-1", 2, 500), CommandContext::at(at(0)).by("alice"))
            .unwrap();

        assert_eq!(produced, 1);
        assert_eq!(order.version(), 1);
        assert_eq!(order.committed_version(), 0);
        assert_eq!(order.pending()[0].sequence_number, 1);
        assert_eq!(order.pending()[0].actor.as_deref(), Some("alice"));
        assert_eq!(order.state().total_cents, 1000);
    }

    #[test]
    fn rejected_commands_change_nothing() {
        let mut order = fresh();
        let err = order
            .execute(&OrderCommand::place("alice"), CommandContext::at(at(0)))
            .unwrap_err();

        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert!(!order.has_pending());
        assert_eq!(order.version(), 0);
    }

    #[test]
    fn repeated_etag_is_a_no_op() {
        let mut order = fresh();
        let context = CommandContext::at(at(0)).with_etag("cmd-1");
        order.execute(&OrderCommand::add("sku-1", 1, 100), context.clone()).unwrap();

        let produced = order.execute(&OrderCommand::add("sku-1", 1, 100), context).unwrap();

        assert_eq!(produced, 0);
        assert_eq!(order.pending().len(), 1);
        assert_eq!(order.state().item_count, 1);
    }

    #[test]
    fn each_event_of_a_command_gets_its_own_token() {
        let mut order = fresh();
        order
            .execute(
                &OrderCommand::bundle(&["sku-a", "sku-b"], 100),
                CommandContext::at(at(0)).with_etag("bundle-1"),
            )
            .unwrap();

        let tokens: Vec<_> = order.pending().iter().map(|e| e.etag.clone()).collect();
        assert_eq!(
            tokens,
            vec![Some("bundle-1#0".to_string()), Some("bundle-1#1".to_string())]
        );
        assert!(order.reflects("bundle-1"));
        assert!(!order.reflects("bundle-1#0"));
    }

    #[test]
    fn snapshot_carries_the_tokens_and_time_of_committed_events() {
        let mut order = fresh();
        order
            .execute(
                &OrderCommand::bundle(&["sku-a", "sku-b"], 100),
                CommandContext::at(at(4)).with_etag("bundle-1"),
            )
            .unwrap();
        let stored: Vec<StoredEvent> = order.pending().iter().cloned().map(PendingEvent::into_stored).collect();
        order.mark_committed(stored);

        let snapshot = order.to_snapshot(at(9)).unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.last_event_at, Some(at(4)));
        assert_eq!(
            snapshot.etags.into_iter().collect::<Vec<_>>(),
            vec!["bundle-1#0".to_string(), "bundle-1#1".to_string()]
        );
    }

    #[test]
    fn command_etag_strips_only_a_numeric_index() {
        assert_eq!(command_etag("scheduled:a:1#3"), "scheduled:a:1");
        assert_eq!(command_etag("cmd#tag#0"), "cmd#tag");
        assert_eq!(command_etag("cmd#tag"), "cmd#tag");
        assert_eq!(command_etag("plain"), "plain");
        assert_eq!(command_etag(&event_etag("x#", 12)), "x#");
    }

    #[test]
    fn mark_committed_moves_pending_into_history() {
        let mut order = fresh();
        order.execute(&OrderCommand::add("sku-1", 1, 100), CommandContext::at(at(0))).unwrap();
        order.execute(&OrderCommand::place("alice"), CommandContext::at(at(1))).unwrap();

        let stored: Vec<StoredEvent> = order.pending().iter().cloned().map(PendingEvent::into_stored).collect();
        order.mark_committed(stored);

        assert!(!order.has_pending());
        assert_eq!(order.history().len(), 2);
        assert_eq!(order.version(), 2);
        assert_eq!(order.committed_version(), 2);
    }
}
