//! Turning queue deliveries into trigger passes.
//!
//! For each message:
//!
//! 1. decode the lookup key
//! 2. trigger due commands for that aggregate
//! 3. complete the message if the pass succeeded without failures
//! 4. otherwise complete it anyway if the record is already resolved
//! 5. otherwise leave it for the transport to redeliver
//!
//! The adapter never rejects a message. Duplicate deliveries find the record
//! resolved and complete without reapplying it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::scheduling::{CommandTriggerEngine, ScheduledCommandStore, TriggerSelector};

use super::message::{DeliveredMessage, ScheduledCommandMessage};
use super::transport::QueueTransport;

const DEFAULT_HANDLING_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// This delivery's trigger pass applied the command.
    Applied,
    /// An earlier or concurrent delivery already resolved it.
    AlreadyResolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeliveryReason {
    Undecodable(String),
    /// The record is still `Scheduled`: not yet due, deferred, or retrying.
    Unresolved,
    /// The handling window elapsed.
    TimedOut,
    /// Trigger, lookup, or completion failed.
    Failed(String),
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Completed(CompletionReason),
    LeftForRedelivery(RedeliveryReason),
}

impl Disposition {
    pub fn is_completed(&self) -> bool {
        matches!(self, Disposition::Completed(_))
    }
}

pub struct QueueDeliveryAdapter<S> {
    engine: Arc<CommandTriggerEngine<S>>,
    transport: Arc<dyn QueueTransport>,
    handling_window: Duration,
}

impl<S> core::fmt::Debug for QueueDeliveryAdapter<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueDeliveryAdapter")
            .field("handling_window", &self.handling_window)
            .finish()
    }
}

impl<S: ScheduledCommandStore> QueueDeliveryAdapter<S> {
    pub fn new(engine: Arc<CommandTriggerEngine<S>>, transport: Arc<dyn QueueTransport>) -> Self {
        Self {
            engine,
            transport,
            handling_window: DEFAULT_HANDLING_WINDOW,
        }
    }

    pub fn with_handling_window(mut self, window: Duration) -> Self {
        self.handling_window = window;
        self
    }

    pub fn engine(&self) -> &Arc<CommandTriggerEngine<S>> {
        &self.engine
    }

    pub fn transport(&self) -> &Arc<dyn QueueTransport> {
        &self.transport
    }

    /// Handle one delivery. Never fails: every outcome is a [`Disposition`].
    #[instrument(
        skip(self, message),
        fields(message_id = %message.message_id, delivery_count = message.delivery_count)
    )]
    pub async fn handle(&self, message: &DeliveredMessage) -> Disposition {
        let decoded = match ScheduledCommandMessage::decode(&message.body) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "undecodable delivery message; leaving it for the dead-letter queue");
                return Disposition::LeftForRedelivery(RedeliveryReason::Undecodable(e.to_string()));
            }
        };

        let reason = match tokio::time::timeout(self.handling_window, self.decide(&decoded)).await {
            Ok(Ok(reason)) => reason,
            Ok(Err(reason)) => return Disposition::LeftForRedelivery(reason),
            Err(_) => {
                warn!(key = %decoded.key(), "handling window elapsed; leaving message for redelivery");
                return Disposition::LeftForRedelivery(RedeliveryReason::TimedOut);
            }
        };

        match self.transport.complete(message).await {
            Ok(()) => {
                debug!(key = %decoded.key(), ?reason, "delivery message completed");
                Disposition::Completed(reason)
            }
            Err(e) => {
                warn!(key = %decoded.key(), error = %e, "failed to complete delivery message");
                Disposition::LeftForRedelivery(RedeliveryReason::Failed(e.to_string()))
            }
        }
    }

    /// Whether the message may be completed, and why.
    async fn decide(&self, message: &ScheduledCommandMessage) -> Result<CompletionReason, RedeliveryReason> {
        let selector = TriggerSelector::due_by(self.engine.now()).for_aggregate(message.aggregate_id);
        match self.engine.trigger(&selector).await {
            Ok(result) if result.failed_commands.is_empty() && !result.successful_commands.is_empty() => {
                return Ok(CompletionReason::Applied);
            }
            Ok(result) => debug!(
                key = %message.key(),
                succeeded = result.successful_commands.len(),
                failed = result.failed_commands.len(),
                deferred = result.deferred_commands.len(),
                "trigger pass did not settle the message"
            ),
            Err(e) => warn!(key = %message.key(), error = %e, "trigger failed"),
        }

        match self.engine.store().get(message.key()).await {
            Ok(Some(record)) if record.is_resolved() => {
                info!(key = %message.key(), state = ?record.state(), "command already resolved");
                Ok(CompletionReason::AlreadyResolved)
            }
            Ok(_) => Err(RedeliveryReason::Unresolved),
            Err(e) => Err(RedeliveryReason::Failed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::InMemoryQueue;
    use crate::scheduling::{
        ApplyError, CommandApplier, CommandScheduler, CommandState, InMemoryScheduledCommandStore,
        RetryPolicy, ScheduleRequest, ScheduledCommand, SchedulingPolicy,
    };
    use crate::test_fixtures::{Harness, Order, OrderCommand, at};
    use async_trait::async_trait;
    use chronicle_core::AggregateId;

    struct Wiring {
        h: Harness,
        queue: Arc<InMemoryQueue>,
        scheduler: CommandScheduler<Arc<InMemoryScheduledCommandStore>>,
        adapter: QueueDeliveryAdapter<Arc<InMemoryScheduledCommandStore>>,
    }

    fn wire() -> Wiring {
        let h = Harness::new();
        let store = Arc::new(InMemoryScheduledCommandStore::new());
        let queue = Arc::new(InMemoryQueue::new(h.clock.clone()));
        let scheduler = CommandScheduler::new(store.clone(), h.store.clone(), h.clock.clone())
            .with_transport(queue.clone());
        let engine = CommandTriggerEngine::new(store, h.store.clone(), h.clock.clone())
            .register_repository(h.repository.clone());
        let adapter = QueueDeliveryAdapter::new(Arc::new(engine), queue.clone());
        Wiring {
            h,
            queue,
            scheduler,
            adapter,
        }
    }

    async fn next(queue: &InMemoryQueue) -> DeliveredMessage {
        queue.receive(1, Duration::ZERO).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn applied_command_completes_the_message() {
        let w = wire();
        let id = AggregateId::new();
        w.scheduler
            .schedule::<Order>(ScheduleRequest::new(id, OrderCommand::add("sku-1", 1, 100)))
            .await
            .unwrap();

        let disposition = w.adapter.handle(&next(&w.queue).await).await;

        assert_eq!(disposition, Disposition::Completed(CompletionReason::Applied));
        assert!(w.queue.is_empty());
    }

    #[tokio::test]
    async fn not_yet_due_command_is_left_for_redelivery() {
        let w = wire();
        let scheduled = w
            .scheduler
            .schedule::<Order>(
                ScheduleRequest::new(AggregateId::new(), OrderCommand::annotate("later")).due_at(at(30)),
            )
            .await
            .unwrap();
        // A copy sent without a deliver-at time arrives ahead of the record's due time.
        let body = ScheduledCommandMessage::for_command(&scheduled).encode().unwrap();
        w.queue.send(body, None).await.unwrap();

        let disposition = w.adapter.handle(&next(&w.queue).await).await;

        assert_eq!(disposition, Disposition::LeftForRedelivery(RedeliveryReason::Unresolved));
        assert_eq!(w.queue.len(), 2);
        let record = w.adapter.engine().store().get(scheduled.key()).await.unwrap().unwrap();
        assert_eq!(record.state(), CommandState::Scheduled);
    }

    #[tokio::test]
    async fn undecodable_bodies_are_never_completed() {
        let w = wire();
        w.queue.send("{not json".to_string(), None).await.unwrap();

        let disposition = w.adapter.handle(&next(&w.queue).await).await;

        assert!(matches!(
            disposition,
            Disposition::LeftForRedelivery(RedeliveryReason::Undecodable(_))
        ));
        assert_eq!(w.queue.len(), 1);
    }

    #[tokio::test]
    async fn permanently_failed_command_completes_as_resolved() {
        let w = wire();
        let id = AggregateId::new();
        let engine = CommandTriggerEngine::new(
            w.adapter.engine().store().clone(),
            w.h.store.clone(),
            w.h.clock.clone(),
        )
        .register_repository(w.h.repository.clone())
        .with_policy(SchedulingPolicy::default().with_retry(RetryPolicy::no_retry()));
        let adapter = QueueDeliveryAdapter::new(Arc::new(engine), w.queue.clone());
        w.scheduler
            .schedule::<Order>(ScheduleRequest::new(id, OrderCommand::place("ops")))
            .await
            .unwrap();
        let message = next(&w.queue).await;

        // The pass fails the command for good, which still resolves the message.
        let disposition = adapter.handle(&message).await;

        assert_eq!(disposition, Disposition::Completed(CompletionReason::AlreadyResolved));
    }

    struct SlowApplier;

    #[async_trait]
    impl CommandApplier for SlowApplier {
        async fn apply(&self, _: &ScheduledCommand) -> Result<(), ApplyError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn expired_handling_window_leaves_the_record_scheduled() {
        let w = wire();
        let engine = CommandTriggerEngine::new(
            w.adapter.engine().store().clone(),
            w.h.store.clone(),
            w.h.clock.clone(),
        )
        .register("order", Arc::new(SlowApplier));
        let adapter = QueueDeliveryAdapter::new(Arc::new(engine), w.queue.clone())
            .with_handling_window(Duration::from_millis(20));
        let scheduled = w
            .scheduler
            .schedule::<Order>(ScheduleRequest::new(AggregateId::new(), OrderCommand::annotate("slow")))
            .await
            .unwrap();

        let disposition = adapter.handle(&next(&w.queue).await).await;

        assert_eq!(disposition, Disposition::LeftForRedelivery(RedeliveryReason::TimedOut));
        let record = adapter.engine().store().get(scheduled.key()).await.unwrap().unwrap();
        assert_eq!(record.state(), CommandState::Scheduled);
    }
}
