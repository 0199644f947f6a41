use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use chronicle_core::{Aggregate, AggregateId, Clock, Command};

use super::store::{ScheduleStoreError, ScheduledCommandStore};
use super::types::{DeliveryPrecondition, ScheduledCommand};
use crate::delivery::{QueueTransport, ScheduledCommandMessage};
use crate::event_store::{EventStore, EventStoreError};

/// Reservations can race with another scheduler for the same stream.
const MAX_RESERVATION_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("command could not be serialized: {0}")]
    Serialization(String),

    #[error(transparent)]
    Store(#[from] ScheduleStoreError),

    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),
}

/// What to run, against which aggregate, and when.
#[derive(Debug, Clone)]
pub struct ScheduleRequest<C> {
    pub aggregate_id: AggregateId,
    pub command: C,
    pub due_time: Option<DateTime<Utc>>,
    pub precondition: Option<DeliveryPrecondition>,
    /// Explicit position; reserved automatically when `None`.
    pub sequence_number: Option<u64>,
}

impl<C: Command> ScheduleRequest<C> {
    pub fn new(aggregate_id: AggregateId, command: C) -> Self {
        Self {
            aggregate_id,
            command,
            due_time: None,
            precondition: None,
            sequence_number: None,
        }
    }

    pub fn due_at(mut self, due_time: DateTime<Utc>) -> Self {
        self.due_time = Some(due_time);
        self
    }

    pub fn after(mut self, precondition: DeliveryPrecondition) -> Self {
        self.precondition = Some(precondition);
        self
    }

    pub fn at_sequence(mut self, sequence_number: u64) -> Self {
        self.sequence_number = Some(sequence_number);
        self
    }
}

/// Persists scheduled commands and hands their delivery messages to the queue.
pub struct CommandScheduler<S> {
    store: S,
    events: Arc<dyn EventStore>,
    transport: Option<Arc<dyn QueueTransport>>,
    clock: Arc<dyn Clock>,
}

impl<S> core::fmt::Debug for CommandScheduler<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandScheduler")
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

impl<S: ScheduledCommandStore> CommandScheduler<S> {
    pub fn new(store: S, events: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            events,
            transport: None,
            clock,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn QueueTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record a command for later application.
    ///
    /// The record is durable once this returns. Enqueueing its delivery
    /// message is best effort: a failure is logged and the periodic sweep
    /// picks the record up instead.
    #[instrument(
        skip(self, request),
        fields(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = %request.aggregate_id),
        err
    )]
    pub async fn schedule<A: Aggregate>(
        &self,
        request: ScheduleRequest<A::Command>,
    ) -> Result<ScheduledCommand, SchedulingError> {
        let body = serde_json::to_value(&request.command)
            .map_err(|e| SchedulingError::Serialization(e.to_string()))?;

        let mut attempt = 0;
        let command = loop {
            attempt += 1;
            let sequence_number = match request.sequence_number {
                Some(n) => n,
                None => self.reserve(request.aggregate_id).await?,
            };
            let command = ScheduledCommand {
                aggregate_id: request.aggregate_id,
                aggregate_type: A::AGGREGATE_TYPE.to_string(),
                sequence_number,
                command_name: request.command.command_name().to_string(),
                command: body.clone(),
                created_at: self.clock.now(),
                due_time: request.due_time,
                precondition: request.precondition,
                attempts: 0,
                last_error: None,
                applied_time: None,
                final_attempt_time: None,
            };

            match self.store.insert(command.clone()).await {
                Ok(()) => break command,
                Err(ScheduleStoreError::AlreadyExists(key))
                    if request.sequence_number.is_none() && attempt < MAX_RESERVATION_ATTEMPTS =>
                {
                    debug!(%key, "sequence number taken by a concurrent scheduler; reserving again");
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.enqueue(&command).await;
        Ok(command)
    }

    /// Next position after both the committed stream and anything already scheduled.
    async fn reserve(&self, aggregate_id: AggregateId) -> Result<u64, SchedulingError> {
        let committed = self.events.stream_version(aggregate_id).await?;
        let scheduled = self.store.max_sequence_number(aggregate_id).await?;
        Ok(committed.max(scheduled) + 1)
    }

    async fn enqueue(&self, command: &ScheduledCommand) {
        let Some(transport) = &self.transport else {
            return;
        };
        let body = match ScheduledCommandMessage::for_command(command).encode() {
            Ok(body) => body,
            Err(e) => {
                warn!(key = %command.key(), error = %e, "could not encode delivery message");
                return;
            }
        };
        match transport.send(body, command.due_time).await {
            Ok(message_id) => debug!(key = %command.key(), message_id = %message_id, "delivery message enqueued"),
            Err(e) => warn!(
                key = %command.key(),
                error = %e,
                "failed to enqueue delivery message; the sweep will pick the command up"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{InMemoryQueue, QueueTransport};
    use crate::scheduling::InMemoryScheduledCommandStore;
    use crate::test_fixtures::{Harness, Order, OrderCommand, at};
    use std::time::Duration;

    fn scheduler(h: &Harness) -> (Arc<InMemoryQueue>, CommandScheduler<Arc<InMemoryScheduledCommandStore>>) {
        let queue = Arc::new(InMemoryQueue::new(h.clock.clone()));
        let scheduler = CommandScheduler::new(
            Arc::new(InMemoryScheduledCommandStore::new()),
            h.store.clone(),
            h.clock.clone(),
        )
        .with_transport(queue.clone());
        (queue, scheduler)
    }

    #[tokio::test]
    async fn reserves_the_position_after_the_stream_and_earlier_schedules() {
        let h = Harness::new();
        let id = h.seed_order(3).await;
        let (_, scheduler) = scheduler(&h);

        let first = scheduler
            .schedule::<Order>(ScheduleRequest::new(id, OrderCommand::place("ops")).due_at(at(30)))
            .await
            .unwrap();
        let second = scheduler
            .schedule::<Order>(ScheduleRequest::new(id, OrderCommand::ship("ups")).due_at(at(60)))
            .await
            .unwrap();

        assert_eq!(first.sequence_number, 4);
        assert_eq!(second.sequence_number, 5);
        assert_eq!(first.aggregate_type, "order");
        assert_eq!(first.command_name, "place");
        assert_eq!(first.created_at, at(0));
    }

    #[tokio::test]
    async fn explicit_positions_are_not_reserved_again() {
        let h = Harness::new();
        let id = AggregateId::new();
        let (_, scheduler) = scheduler(&h);

        scheduler
            .schedule::<Order>(ScheduleRequest::new(id, OrderCommand::annotate("a")).at_sequence(9))
            .await
            .unwrap();
        let err = scheduler
            .schedule::<Order>(ScheduleRequest::new(id, OrderCommand::annotate("b")).at_sequence(9))
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulingError::Store(ScheduleStoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn enqueues_a_message_naming_the_record() {
        let h = Harness::new();
        let id = AggregateId::new();
        let (queue, scheduler) = scheduler(&h);

        let command = scheduler
            .schedule::<Order>(ScheduleRequest::new(id, OrderCommand::add("sku-1", 1, 100)))
            .await
            .unwrap();

        let delivered = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(delivered.len(), 1);
        let message = ScheduledCommandMessage::decode(&delivered[0].body).unwrap();
        assert_eq!(message.key(), command.key());
        assert_eq!(message.due_time, None);
    }

    #[tokio::test]
    async fn future_commands_are_not_delivered_before_they_are_due() {
        let h = Harness::new();
        let id = AggregateId::new();
        let (queue, scheduler) = scheduler(&h);

        scheduler
            .schedule::<Order>(ScheduleRequest::new(id, OrderCommand::annotate("later")).due_at(at(60)))
            .await
            .unwrap();

        assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());
        h.clock.set(at(59));
        assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());

        h.clock.set(at(60));
        let delivered = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].delivery_count, 1);
    }
}

