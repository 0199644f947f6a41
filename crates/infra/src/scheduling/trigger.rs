//! Applying due scheduled commands.
//!
//! ```text
//! due records ─┬─ precondition pending ──────────────→ deferred (or failed once the wait expires)
//!              ├─ no applier / undecodable ──────────→ PermanentlyFailed
//!              └─ applier ─┬─ ok ────────────────────→ Applied
//!                          ├─ rejected, retries left → Scheduled, due later
//!                          ├─ rejected, exhausted ───→ PermanentlyFailed
//!                          └─ concurrency/transient ─→ untouched
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use chronicle_core::{Aggregate, Clock, DomainError};
use chronicle_events::{EventBus, EventEnvelope};
use serde_json::Value as JsonValue;

use super::policy::SchedulingPolicy;
use super::store::{ScheduleStoreError, ScheduledCommandStore};
use super::types::{CommandFailure, FailureKind, ScheduledCommand, TriggerResult, TriggerSelector};
use crate::event_store::{ConcurrencyError, EventStore};
use crate::repository::{EventSourcedRepository, RepositoryError};

/// Actor recorded on events produced by scheduled commands.
pub const SCHEDULER_ACTOR: &str = "scheduler";

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("command rejected: {0}")]
    Rejected(DomainError),

    #[error(transparent)]
    Concurrency(ConcurrencyError),

    #[error("command cannot be delivered: {0}")]
    Undeliverable(String),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

/// Applies one scheduled command to its target aggregate.
#[async_trait]
pub trait CommandApplier: Send + Sync {
    async fn apply(&self, command: &ScheduledCommand) -> Result<(), ApplyError>;
}

/// Loads the target through a repository, executes, and saves.
///
/// Events carry the record's etag, so applying the same record twice
/// produces its events once.
pub struct RepositoryApplier<A, S, B>
where
    A: Aggregate,
{
    repository: Arc<EventSourcedRepository<A, S, B>>,
}

impl<A, S, B> RepositoryApplier<A, S, B>
where
    A: Aggregate,
{
    pub fn new(repository: Arc<EventSourcedRepository<A, S, B>>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl<A, S, B> CommandApplier for RepositoryApplier<A, S, B>
where
    A: Aggregate,
    S: EventStore + 'static,
    B: EventBus<EventEnvelope<JsonValue>> + 'static,
{
    async fn apply(&self, scheduled: &ScheduledCommand) -> Result<(), ApplyError> {
        let command: A::Command = serde_json::from_value(scheduled.command.clone()).map_err(|e| {
            ApplyError::Undeliverable(format!(
                "body of '{}' is not a {} command: {e}",
                scheduled.command_name,
                A::AGGREGATE_TYPE
            ))
        })?;

        let mut aggregate = match self.repository.get_latest(scheduled.aggregate_id).await {
            Ok(Some(aggregate)) => aggregate,
            Ok(None) => self.repository.create(scheduled.aggregate_id),
            Err(e) => return Err(ApplyError::Infrastructure(e.to_string())),
        };

        let context = self
            .repository
            .context()
            .by(SCHEDULER_ACTOR)
            .with_etag(scheduled.etag());
        aggregate
            .execute(&command, context)
            .map_err(ApplyError::Rejected)?;

        match self.repository.save(&mut aggregate).await {
            Ok(_) => Ok(()),
            // Committed; only the fan-out failed.
            Err(RepositoryError::Publish(e)) => {
                warn!(key = %scheduled.key(), error = %e, "scheduled command applied but not published");
                Ok(())
            }
            Err(RepositoryError::Concurrency(conflict)) => Err(ApplyError::Concurrency(conflict)),
            Err(e) => Err(ApplyError::Infrastructure(e.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("could not select due commands: {0}")]
    Store(#[from] ScheduleStoreError),
}

/// Runs due scheduled commands through their appliers.
pub struct CommandTriggerEngine<S> {
    store: S,
    events: Arc<dyn EventStore>,
    appliers: HashMap<String, Arc<dyn CommandApplier>>,
    policy: SchedulingPolicy,
    clock: Arc<dyn Clock>,
}

impl<S> core::fmt::Debug for CommandTriggerEngine<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<_> = self.appliers.keys().collect();
        types.sort();
        f.debug_struct("CommandTriggerEngine")
            .field("appliers", &types)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<S: ScheduledCommandStore> CommandTriggerEngine<S> {
    pub fn new(store: S, events: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            events,
            appliers: HashMap::new(),
            policy: SchedulingPolicy::default(),
            clock,
        }
    }

    pub fn with_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Route records of `aggregate_type` to `applier`.
    pub fn register(mut self, aggregate_type: impl Into<String>, applier: Arc<dyn CommandApplier>) -> Self {
        self.appliers.insert(aggregate_type.into(), applier);
        self
    }

    /// Route records of `A` through a [`RepositoryApplier`].
    pub fn register_repository<A, ES, B>(self, repository: Arc<EventSourcedRepository<A, ES, B>>) -> Self
    where
        A: Aggregate,
        ES: EventStore + 'static,
        B: EventBus<EventEnvelope<JsonValue>> + 'static,
    {
        self.register(A::AGGREGATE_TYPE, Arc::new(RepositoryApplier::new(repository)))
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &SchedulingPolicy {
        &self.policy
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Process every record matching `selector`, in due order.
    ///
    /// Only the initial selection can fail the call; per-record trouble is
    /// reported in the result.
    #[instrument(
        skip(self, selector),
        fields(due_by = %selector.due_at_or_before, aggregate_id = ?selector.aggregate_id),
        err
    )]
    pub async fn trigger(&self, selector: &TriggerSelector) -> Result<TriggerResult, TriggerError> {
        let due = self.store.due(selector).await?;
        let mut result = TriggerResult::default();

        for command in due {
            self.process(command, &mut result).await;
        }

        if !result.is_empty() {
            info!(
                succeeded = result.successful_commands.len(),
                failed = result.failed_commands.len(),
                deferred = result.deferred_commands.len(),
                "trigger pass finished"
            );
        }
        Ok(result)
    }

    /// Trigger everything due now.
    pub async fn sweep(&self) -> Result<TriggerResult, TriggerError> {
        self.trigger(&TriggerSelector::due_by(self.clock.now())).await
    }

    async fn process(&self, command: ScheduledCommand, result: &mut TriggerResult) {
        let key = command.key();

        if let Some(precondition) = command.precondition {
            match self
                .events
                .find_event(precondition.aggregate_id, precondition.sequence_number)
                .await
            {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let now = self.clock.now();
                    let waiting_since = command.due_time.unwrap_or(command.created_at);
                    if !self.policy.precondition_expired(waiting_since, now) {
                        debug!(%key, awaiting = %precondition.aggregate_id, sequence_number = precondition.sequence_number, "precondition not yet satisfied");
                        result.deferred_commands.push(command);
                        return;
                    }
                    let error = format!(
                        "event {} of {} did not appear within the allowed wait",
                        precondition.sequence_number, precondition.aggregate_id
                    );
                    self.fail_permanently(command, error, FailureKind::PreconditionTimedOut, false, result)
                        .await;
                    return;
                }
                Err(e) => {
                    transient(command, format!("precondition check failed: {e}"), result);
                    return;
                }
            }
        }

        let Some(applier) = self.appliers.get(&command.aggregate_type) else {
            let error = format!("no applier registered for '{}'", command.aggregate_type);
            self.fail_permanently(command, error, FailureKind::Undeliverable, false, result)
                .await;
            return;
        };

        match applier.apply(&command).await {
            Ok(()) => match self.store.mark_applied(key, self.clock.now()).await {
                Ok(true) => {
                    debug!(%key, "scheduled command applied");
                    result.successful_commands.push(command);
                }
                Ok(false) => debug!(%key, "scheduled command resolved concurrently"),
                Err(e) => transient(command, format!("applied but not recorded: {e}"), result),
            },
            Err(ApplyError::Rejected(rejection)) => {
                self.record_rejection(command, rejection.to_string(), result).await;
            }
            Err(ApplyError::Undeliverable(reason)) => {
                self.fail_permanently(command, reason, FailureKind::Undeliverable, true, result)
                    .await;
            }
            Err(ApplyError::Concurrency(conflict)) => {
                info!(%key, "{conflict}");
                result.failed_commands.push(CommandFailure {
                    command,
                    error: conflict.to_string(),
                    will_retry: true,
                    kind: FailureKind::Concurrency,
                });
            }
            Err(ApplyError::Infrastructure(e)) => transient(command, e, result),
        }
    }

    async fn record_rejection(&self, command: ScheduledCommand, error: String, result: &mut TriggerResult) {
        let key = command.key();
        let attempts = command.attempts + 1;
        let now = self.clock.now();

        if !self.policy.retry.should_retry(attempts) {
            self.fail_permanently(command, error, FailureKind::Rejected, true, result)
                .await;
            return;
        }

        let retry_at = self.policy.retry_at(now, attempts);
        match self.store.record_failed_attempt(key, &error, retry_at).await {
            Ok(true) => {
                warn!(%key, attempts, retry_at = %retry_at, error = %error, "scheduled command rejected; will retry");
                result.failed_commands.push(CommandFailure {
                    command,
                    error,
                    will_retry: true,
                    kind: FailureKind::Rejected,
                });
            }
            Ok(false) => debug!(%key, "scheduled command resolved concurrently"),
            Err(e) => transient(command, format!("failed attempt not recorded: {e}"), result),
        }
    }

    async fn fail_permanently(
        &self,
        command: ScheduledCommand,
        error: String,
        kind: FailureKind,
        attempted: bool,
        result: &mut TriggerResult,
    ) {
        let key = command.key();
        match self
            .store
            .mark_failed(key, self.clock.now(), &error, attempted)
            .await
        {
            Ok(true) => {
                warn!(%key, ?kind, error = %error, "scheduled command failed permanently");
                result.failed_commands.push(CommandFailure {
                    command,
                    error,
                    will_retry: false,
                    kind,
                });
            }
            Ok(false) => debug!(%key, "scheduled command resolved concurrently"),
            Err(e) => transient(command, format!("final failure not recorded: {e}"), result),
        }
    }
}

fn transient(command: ScheduledCommand, error: String, result: &mut TriggerResult) {
    warn!(key = %command.key(), error = %error, "transient failure applying scheduled command");
    result.failed_commands.push(CommandFailure {
        command,
        error,
        will_retry: true,
        kind: FailureKind::Transient,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use chronicle_core::AggregateId;

    use crate::scheduling::{
        CommandScheduler, CommandState, DeliveryPrecondition, InMemoryScheduledCommandStore,
        RetryPolicy, ScheduleRequest,
    };
    use crate::test_fixtures::{Harness, Order, OrderCommand, at};

    type Engine = CommandTriggerEngine<Arc<InMemoryScheduledCommandStore>>;

    fn wire(h: &Harness, policy: SchedulingPolicy) -> (CommandScheduler<Arc<InMemoryScheduledCommandStore>>, Engine) {
        let store = Arc::new(InMemoryScheduledCommandStore::new());
        let scheduler = CommandScheduler::new(store.clone(), h.store.clone(), h.clock.clone());
        let engine = CommandTriggerEngine::new(store, h.store.clone(), h.clock.clone())
            .with_policy(policy)
            .register_repository(h.repository.clone());
        (scheduler, engine)
    }

    #[tokio::test]
    async fn due_command_is_applied_exactly_once() {
        let h = Harness::new();
        let id = h.seed_order(1).await;
        let (scheduler, engine) = wire(&h, SchedulingPolicy::default());
        scheduler
            .schedule::<Order>(ScheduleRequest::new(id, OrderCommand::place("ops")).due_at(at(10)))
            .await
            .unwrap();

        let early = engine.trigger(&TriggerSelector::due_by(at(9))).await.unwrap();
        assert!(early.is_empty());

        let first = engine.trigger(&TriggerSelector::due_by(at(10))).await.unwrap();
        let second = engine.trigger(&TriggerSelector::due_by(at(10))).await.unwrap();

        assert_eq!(first.successful_commands.len(), 1);
        assert!(first.failed_commands.is_empty());
        assert!(second.is_empty());

        let order = h.repository.get_latest(id).await.unwrap().unwrap();
        assert_eq!(order.state().placed_by.as_deref(), Some("ops"));
        assert_eq!(order.version(), 2);
        let placed = &order.history()[1];
        assert_eq!(placed.actor.as_deref(), Some(SCHEDULER_ACTOR));
        assert_eq!(placed.command_etag(), Some(first.successful_commands[0].etag().as_str()));
    }

    #[tokio::test]
    async fn rejections_are_retried_with_backoff_then_failed() {
        let h = Harness::new();
        let id = AggregateId::new();
        let policy = SchedulingPolicy::default().with_retry(RetryPolicy::fixed(2, Duration::from_secs(60)));
        let (scheduler, engine) = wire(&h, policy);
        // Placing an empty order is always rejected.
        let scheduled = scheduler
            .schedule::<Order>(ScheduleRequest::new(id, OrderCommand::place("ops")))
            .await
            .unwrap();

        let first = engine.trigger(&TriggerSelector::due_by(at(0))).await.unwrap();
        assert_eq!(first.failed_commands.len(), 1);
        assert!(first.failed_commands[0].will_retry);
        assert_eq!(first.failed_commands[0].kind, FailureKind::Rejected);

        let record = engine.store().get(scheduled.key()).await.unwrap().unwrap();
        assert_eq!(record.state(), CommandState::Scheduled);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.due_time, Some(at(1)));

        assert!(engine.trigger(&TriggerSelector::due_by(at(0))).await.unwrap().is_empty());

        let last = engine.trigger(&TriggerSelector::due_by(at(1))).await.unwrap();
        assert_eq!(last.failed_commands.len(), 1);
        assert!(!last.failed_commands[0].will_retry);

        let record = engine.store().get(scheduled.key()).await.unwrap().unwrap();
        assert_eq!(record.state(), CommandState::PermanentlyFailed);
        assert_eq!(record.attempts, 2);
        assert!(record.last_error.unwrap().contains("empty order"));
    }

    #[tokio::test]
    async fn precondition_defers_until_the_event_lands() {
        let h = Harness::new();
        let upstream = AggregateId::new();
        let target = AggregateId::new();
        let (scheduler, engine) = wire(&h, SchedulingPolicy::default());
        scheduler
            .schedule::<Order>(
                ScheduleRequest::new(target, OrderCommand::annotate("after upstream"))
                    .after(DeliveryPrecondition::event_exists(upstream, 1)),
            )
            .await
            .unwrap();

        let waiting = engine.sweep().await.unwrap();
        assert_eq!(waiting.deferred_commands.len(), 1);
        assert!(waiting.failed_commands.is_empty());

        let mut order = h.repository.create(upstream);
        order.execute(&OrderCommand::add("sku-1", 1, 100), h.repository.context()).unwrap();
        h.repository.save(&mut order).await.unwrap();

        let applied = engine.sweep().await.unwrap();
        assert_eq!(applied.successful_commands.len(), 1);
    }

    #[tokio::test]
    async fn precondition_past_its_max_wait_fails_permanently() {
        let h = Harness::new();
        let target = AggregateId::new();
        let policy = SchedulingPolicy::default().with_precondition_max_wait(Duration::from_secs(300));
        let (scheduler, engine) = wire(&h, policy);
        let scheduled = scheduler
            .schedule::<Order>(
                ScheduleRequest::new(target, OrderCommand::annotate("never"))
                    .after(DeliveryPrecondition::event_exists(AggregateId::new(), 1)),
            )
            .await
            .unwrap();

        h.clock.advance(chrono::Duration::minutes(6));
        let result = engine.sweep().await.unwrap();

        assert_eq!(result.failed_commands.len(), 1);
        assert_eq!(result.failed_commands[0].kind, FailureKind::PreconditionTimedOut);
        let record = engine.store().get(scheduled.key()).await.unwrap().unwrap();
        assert_eq!(record.state(), CommandState::PermanentlyFailed);
        assert_eq!(record.attempts, 0);
    }

    #[tokio::test]
    async fn unrouted_aggregate_types_are_undeliverable() {
        let h = Harness::new();
        let store = Arc::new(InMemoryScheduledCommandStore::new());
        let scheduler = CommandScheduler::new(store.clone(), h.store.clone(), h.clock.clone());
        let engine = CommandTriggerEngine::new(store, h.store.clone(), h.clock.clone());
        scheduler
            .schedule::<Order>(ScheduleRequest::new(AggregateId::new(), OrderCommand::annotate("x")))
            .await
            .unwrap();

        let result = engine.sweep().await.unwrap();

        assert_eq!(result.failed_commands.len(), 1);
        assert_eq!(result.failed_commands[0].kind, FailureKind::Undeliverable);
        assert!(!result.failed_commands[0].will_retry);
    }

    struct FlakyApplier {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl CommandApplier for FlakyApplier {
        async fn apply(&self, _: &ScheduledCommand) -> Result<(), ApplyError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            Err(ApplyError::Infrastructure("database unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn transient_failures_leave_the_record_untouched() {
        let h = Harness::new();
        let store = Arc::new(InMemoryScheduledCommandStore::new());
        let scheduler = CommandScheduler::new(store.clone(), h.store.clone(), h.clock.clone());
        let applier = Arc::new(FlakyApplier { calls: Mutex::new(0) });
        let engine = CommandTriggerEngine::new(store, h.store.clone(), h.clock.clone())
            .register("order", applier.clone());
        let scheduled = scheduler
            .schedule::<Order>(ScheduleRequest::new(AggregateId::new(), OrderCommand::annotate("x")))
            .await
            .unwrap();

        let result = engine.sweep().await.unwrap();

        assert_eq!(result.failed_commands[0].kind, FailureKind::Transient);
        assert_eq!(*applier.calls.lock().unwrap(), 1);
        let record = engine.store().get(scheduled.key()).await.unwrap().unwrap();
        assert_eq!(record, scheduled);
    }
}
