//! Scheduled command persistence.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use chronicle_core::AggregateId;

use super::types::{ScheduledCommand, ScheduledCommandKey, TriggerSelector};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleStoreError {
    #[error("scheduled command already exists: {0}")]
    AlreadyExists(ScheduledCommandKey),
    #[error("scheduled command already resolved: {0}")]
    AlreadyResolved(ScheduledCommandKey),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable store of scheduled commands.
///
/// Terminal markers are written with conditional updates: each `mark_*` and
/// `record_failed_attempt` only touches a record that is still `Scheduled`
/// and reports whether it did. That is the only coordination two concurrent
/// triggers need.
#[async_trait]
pub trait ScheduledCommandStore: Send + Sync {
    /// Insert a new record. Fails with `AlreadyExists` if the key is taken.
    async fn insert(&self, command: ScheduledCommand) -> Result<(), ScheduleStoreError>;

    /// Insert or replace a record that is still `Scheduled`.
    ///
    /// Fails with `AlreadyResolved` when the existing record is terminal.
    async fn upsert(&self, command: ScheduledCommand) -> Result<(), ScheduleStoreError>;

    async fn get(&self, key: ScheduledCommandKey) -> Result<Option<ScheduledCommand>, ScheduleStoreError>;

    /// Unresolved records matching `selector`, ordered by due time (null first),
    /// then aggregate id, then sequence number.
    async fn due(&self, selector: &TriggerSelector) -> Result<Vec<ScheduledCommand>, ScheduleStoreError>;

    /// Highest sequence number scheduled for an aggregate (0 if none).
    async fn max_sequence_number(&self, aggregate_id: AggregateId) -> Result<u64, ScheduleStoreError>;

    /// Set `applied_time` if the record is still `Scheduled`.
    async fn mark_applied(
        &self,
        key: ScheduledCommandKey,
        at: DateTime<Utc>,
    ) -> Result<bool, ScheduleStoreError>;

    /// Set `final_attempt_time` if the record is still `Scheduled`.
    ///
    /// `attempted` counts this failure as an application attempt.
    async fn mark_failed(
        &self,
        key: ScheduledCommandKey,
        at: DateTime<Utc>,
        error: &str,
        attempted: bool,
    ) -> Result<bool, ScheduleStoreError>;

    /// Count a failed attempt and push the due time to `retry_at`, leaving the
    /// record `Scheduled`.
    async fn record_failed_attempt(
        &self,
        key: ScheduledCommandKey,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, ScheduleStoreError>;
}

#[async_trait]
impl<S> ScheduledCommandStore for Arc<S>
where
    S: ScheduledCommandStore + ?Sized,
{
    async fn insert(&self, command: ScheduledCommand) -> Result<(), ScheduleStoreError> {
        (**self).insert(command).await
    }

    async fn upsert(&self, command: ScheduledCommand) -> Result<(), ScheduleStoreError> {
        (**self).upsert(command).await
    }

    async fn get(&self, key: ScheduledCommandKey) -> Result<Option<ScheduledCommand>, ScheduleStoreError> {
        (**self).get(key).await
    }

    async fn due(&self, selector: &TriggerSelector) -> Result<Vec<ScheduledCommand>, ScheduleStoreError> {
        (**self).due(selector).await
    }

    async fn max_sequence_number(&self, aggregate_id: AggregateId) -> Result<u64, ScheduleStoreError> {
        (**self).max_sequence_number(aggregate_id).await
    }

    async fn mark_applied(
        &self,
        key: ScheduledCommandKey,
        at: DateTime<Utc>,
    ) -> Result<bool, ScheduleStoreError> {
        (**self).mark_applied(key, at).await
    }

    async fn mark_failed(
        &self,
        key: ScheduledCommandKey,
        at: DateTime<Utc>,
        error: &str,
        attempted: bool,
    ) -> Result<bool, ScheduleStoreError> {
        (**self).mark_failed(key, at, error, attempted).await
    }

    async fn record_failed_attempt(
        &self,
        key: ScheduledCommandKey,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, ScheduleStoreError> {
        (**self).record_failed_attempt(key, error, retry_at).await
    }
}

/// In-memory scheduled command store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryScheduledCommandStore {
    commands: RwLock<BTreeMap<ScheduledCommandKey, ScheduledCommand>>,
}

impl InMemoryScheduledCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.commands.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned<T>(_: T) -> ScheduleStoreError {
        ScheduleStoreError::Storage("lock poisoned".to_string())
    }

    /// Run `update` on the record if it is still `Scheduled`.
    fn update_unresolved(
        &self,
        key: ScheduledCommandKey,
        update: impl FnOnce(&mut ScheduledCommand),
    ) -> Result<bool, ScheduleStoreError> {
        let mut commands = self.commands.write().map_err(Self::poisoned)?;
        match commands.get_mut(&key) {
            Some(command) if !command.is_resolved() => {
                update(command);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ScheduledCommandStore for InMemoryScheduledCommandStore {
    async fn insert(&self, command: ScheduledCommand) -> Result<(), ScheduleStoreError> {
        let mut commands = self.commands.write().map_err(Self::poisoned)?;
        let key = command.key();
        if commands.contains_key(&key) {
            return Err(ScheduleStoreError::AlreadyExists(key));
        }
        commands.insert(key, command);
        Ok(())
    }

    async fn upsert(&self, command: ScheduledCommand) -> Result<(), ScheduleStoreError> {
        let mut commands = self.commands.write().map_err(Self::poisoned)?;
        let key = command.key();
        if commands.get(&key).is_some_and(ScheduledCommand::is_resolved) {
            return Err(ScheduleStoreError::AlreadyResolved(key));
        }
        commands.insert(key, command);
        Ok(())
    }

    async fn get(&self, key: ScheduledCommandKey) -> Result<Option<ScheduledCommand>, ScheduleStoreError> {
        let commands = self.commands.read().map_err(Self::poisoned)?;
        Ok(commands.get(&key).cloned())
    }

    async fn due(&self, selector: &TriggerSelector) -> Result<Vec<ScheduledCommand>, ScheduleStoreError> {
        let commands = self.commands.read().map_err(Self::poisoned)?;
        let mut due: Vec<ScheduledCommand> = commands
            .values()
            .filter(|c| selector.matches(c))
            .cloned()
            .collect();

        // `None < Some(_)`, so immediately-eligible records come first.
        due.sort_by(|a, b| {
            a.due_time
                .cmp(&b.due_time)
                .then_with(|| a.key().cmp(&b.key()))
        });
        if let Some(limit) = selector.limit {
            due.truncate(limit);
        }
        Ok(due)
    }

    async fn max_sequence_number(&self, aggregate_id: AggregateId) -> Result<u64, ScheduleStoreError> {
        let commands = self.commands.read().map_err(Self::poisoned)?;
        Ok(commands
            .keys()
            .filter(|k| k.aggregate_id == aggregate_id)
            .map(|k| k.sequence_number)
            .max()
            .unwrap_or(0))
    }

    async fn mark_applied(
        &self,
        key: ScheduledCommandKey,
        at: DateTime<Utc>,
    ) -> Result<bool, ScheduleStoreError> {
        self.update_unresolved(key, |command| command.applied_time = Some(at))
    }

    async fn mark_failed(
        &self,
        key: ScheduledCommandKey,
        at: DateTime<Utc>,
        error: &str,
        attempted: bool,
    ) -> Result<bool, ScheduleStoreError> {
        self.update_unresolved(key, |command| {
            if attempted {
                command.attempts += 1;
            }
            command.last_error = Some(error.to_string());
            command.final_attempt_time = Some(at);
        })
    }

    async fn record_failed_attempt(
        &self,
        key: ScheduledCommandKey,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, ScheduleStoreError> {
        self.update_unresolved(key, |command| {
            command.attempts += 1;
            command.last_error = Some(error.to_string());
            command.due_time = Some(retry_at);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::CommandState;
    use crate::test_fixtures::at;

    fn record(aggregate_id: AggregateId, sequence_number: u64, due_minute: Option<i64>) -> ScheduledCommand {
        ScheduledCommand {
            aggregate_id,
            aggregate_type: "order".to_string(),
            sequence_number,
            command_name: "place".to_string(),
            command: serde_json::json!({ "type": "place", "by": "scheduler" }),
            created_at: at(0),
            due_time: due_minute.map(at),
            precondition: None,
            attempts: 0,
            last_error: None,
            applied_time: None,
            final_attempt_time: None,
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_keys() {
        let store = InMemoryScheduledCommandStore::new();
        let id = AggregateId::new();
        store.insert(record(id, 1, None)).await.unwrap();

        let err = store.insert(record(id, 1, Some(5))).await.unwrap_err();
        assert!(matches!(err, ScheduleStoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn due_orders_by_due_time_with_immediate_first() {
        let store = InMemoryScheduledCommandStore::new();
        let id = AggregateId::new();
        store.insert(record(id, 1, Some(20))).await.unwrap();
        store.insert(record(id, 2, None)).await.unwrap();
        store.insert(record(id, 3, Some(10))).await.unwrap();
        store.insert(record(id, 4, Some(90))).await.unwrap();

        let due = store.due(&TriggerSelector::due_by(at(30))).await.unwrap();
        let order: Vec<_> = due.iter().map(|c| c.sequence_number).collect();
        assert_eq!(order, vec![2, 3, 1]);

        let limited = store.due(&TriggerSelector::due_by(at(30)).limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn terminal_markers_are_sticky() {
        let store = InMemoryScheduledCommandStore::new();
        let id = AggregateId::new();
        let key = record(id, 1, None).key();
        store.insert(record(id, 1, None)).await.unwrap();

        assert!(store.mark_applied(key, at(1)).await.unwrap());
        assert!(!store.mark_applied(key, at(2)).await.unwrap());
        assert!(!store.mark_failed(key, at(2), "late", true).await.unwrap());
        assert!(!store.record_failed_attempt(key, "late", at(5)).await.unwrap());

        let stored = store.get(key).await.unwrap().unwrap();
        assert_eq!(stored.state(), CommandState::Applied);
        assert_eq!(stored.applied_time, Some(at(1)));
        assert_eq!(stored.final_attempt_time, None);

        let err = store.upsert(record(id, 1, Some(9))).await.unwrap_err();
        assert!(matches!(err, ScheduleStoreError::AlreadyResolved(_)));
    }

    #[tokio::test]
    async fn failed_attempts_push_the_due_time() {
        let store = InMemoryScheduledCommandStore::new();
        let id = AggregateId::new();
        let key = record(id, 1, None).key();
        store.insert(record(id, 1, None)).await.unwrap();

        assert!(store.record_failed_attempt(key, "rejected", at(3)).await.unwrap());

        let stored = store.get(key).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.due_time, Some(at(3)));
        assert_eq!(stored.last_error.as_deref(), Some("rejected"));
        assert_eq!(stored.state(), CommandState::Scheduled);
        assert!(store.due(&TriggerSelector::due_by(at(2))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn max_sequence_number_is_per_aggregate() {
        let store = InMemoryScheduledCommandStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        store.insert(record(a, 4, None)).await.unwrap();
        store.insert(record(a, 7, None)).await.unwrap();
        store.insert(record(b, 2, None)).await.unwrap();

        assert_eq!(store.max_sequence_number(a).await.unwrap(), 7);
        assert_eq!(store.max_sequence_number(b).await.unwrap(), 2);
        assert_eq!(store.max_sequence_number(AggregateId::new()).await.unwrap(), 0);
    }
}
