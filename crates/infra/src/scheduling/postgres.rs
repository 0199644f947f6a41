use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, QueryBuilder, Row};
use tracing::instrument;

use chronicle_core::AggregateId;

use super::store::{ScheduleStoreError, ScheduledCommandStore};
use super::types::{DeliveryPrecondition, ScheduledCommand, ScheduledCommandKey, TriggerSelector};
use crate::event_store::is_unique_violation;

const SELECT_COLUMNS: &str = r#"
    SELECT
        aggregate_id,
        sequence_number,
        aggregate_type,
        command_name,
        command,
        created_at,
        due_time,
        precondition_aggregate_id,
        precondition_sequence_number,
        attempts,
        last_error,
        applied_time,
        final_attempt_time
    FROM scheduled_commands
"#;

const UNRESOLVED: &str = "applied_time IS NULL AND final_attempt_time IS NULL";

/// Postgres-backed scheduled command store.
///
/// Every state transition is a single `UPDATE ... WHERE <unresolved>`; the
/// affected row count tells the caller whether it won.
#[derive(Debug, Clone)]
pub struct PostgresScheduledCommandStore {
    pool: PgPool,
}

impl PostgresScheduledCommandStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage(context: &str, e: sqlx::Error) -> ScheduleStoreError {
    ScheduleStoreError::Storage(format!("{context}: {e}"))
}

#[async_trait]
impl ScheduledCommandStore for PostgresScheduledCommandStore {
    #[instrument(skip(self, command), fields(key = %command.key()), err)]
    async fn insert(&self, command: ScheduledCommand) -> Result<(), ScheduleStoreError> {
        let key = command.key();
        bind_command(
            sqlx::query(
                r#"
                INSERT INTO scheduled_commands (
                    aggregate_id, sequence_number, aggregate_type, command_name, command,
                    created_at, due_time, precondition_aggregate_id, precondition_sequence_number,
                    attempts, last_error, applied_time, final_attempt_time
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            ),
            &command,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ScheduleStoreError::AlreadyExists(key)
            } else {
                storage("insert_scheduled_command", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self, command), fields(key = %command.key()), err)]
    async fn upsert(&self, command: ScheduledCommand) -> Result<(), ScheduleStoreError> {
        let key = command.key();
        let result = bind_command(
            sqlx::query(
                r#"
                INSERT INTO scheduled_commands AS s (
                    aggregate_id, sequence_number, aggregate_type, command_name, command,
                    created_at, due_time, precondition_aggregate_id, precondition_sequence_number,
                    attempts, last_error, applied_time, final_attempt_time
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (aggregate_id, sequence_number) DO UPDATE SET
                    aggregate_type = EXCLUDED.aggregate_type,
                    command_name = EXCLUDED.command_name,
                    command = EXCLUDED.command,
                    due_time = EXCLUDED.due_time,
                    precondition_aggregate_id = EXCLUDED.precondition_aggregate_id,
                    precondition_sequence_number = EXCLUDED.precondition_sequence_number,
                    attempts = EXCLUDED.attempts,
                    last_error = EXCLUDED.last_error,
                    applied_time = EXCLUDED.applied_time,
                    final_attempt_time = EXCLUDED.final_attempt_time
                WHERE s.applied_time IS NULL AND s.final_attempt_time IS NULL
                "#,
            ),
            &command,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| storage("upsert_scheduled_command", e))?;

        if result.rows_affected() == 0 {
            return Err(ScheduleStoreError::AlreadyResolved(key));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn get(&self, key: ScheduledCommandKey) -> Result<Option<ScheduledCommand>, ScheduleStoreError> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE aggregate_id = $1 AND sequence_number = $2"
        ))
        .bind(key.aggregate_id.as_uuid())
        .bind(key.sequence_number as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage("get_scheduled_command", e))?;

        row.map(|row| {
            ScheduledCommandRow::from_row(&row)
                .map(ScheduledCommand::from)
                .map_err(|e| storage("decode scheduled command row", e))
        })
        .transpose()
    }

    #[instrument(skip(self, selector), fields(due_by = %selector.due_at_or_before), err)]
    async fn due(&self, selector: &TriggerSelector) -> Result<Vec<ScheduledCommand>, ScheduleStoreError> {
        let mut query = QueryBuilder::<sqlx::Postgres>::new(SELECT_COLUMNS);
        query
            .push(" WHERE ")
            .push(UNRESOLVED)
            .push(" AND (due_time IS NULL OR due_time <= ")
            .push_bind(selector.due_at_or_before)
            .push(")");
        if let Some(id) = selector.aggregate_id {
            query.push(" AND aggregate_id = ").push_bind(*id.as_uuid());
        }
        if let Some(aggregate_type) = &selector.aggregate_type {
            query.push(" AND aggregate_type = ").push_bind(aggregate_type.clone());
        }
        query.push(" ORDER BY due_time ASC NULLS FIRST, aggregate_id ASC, sequence_number ASC");
        if let Some(limit) = selector.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage("due_scheduled_commands", e))?;

        rows.iter()
            .map(|row| {
                ScheduledCommandRow::from_row(row)
                    .map(ScheduledCommand::from)
                    .map_err(|e| storage("decode scheduled command row", e))
            })
            .collect()
    }

    async fn max_sequence_number(&self, aggregate_id: AggregateId) -> Result<u64, ScheduleStoreError> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_number) FROM scheduled_commands WHERE aggregate_id = $1",
        )
        .bind(aggregate_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| storage("max_scheduled_sequence", e))?;
        Ok(max.unwrap_or(0) as u64)
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn mark_applied(
        &self,
        key: ScheduledCommandKey,
        at: DateTime<Utc>,
    ) -> Result<bool, ScheduleStoreError> {
        let result = sqlx::query(&format!(
            "UPDATE scheduled_commands SET applied_time = $3 \
             WHERE aggregate_id = $1 AND sequence_number = $2 AND {UNRESOLVED}"
        ))
        .bind(key.aggregate_id.as_uuid())
        .bind(key.sequence_number as i64)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| storage("mark_applied", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(key = %key), err)]
    async fn mark_failed(
        &self,
        key: ScheduledCommandKey,
        at: DateTime<Utc>,
        error: &str,
        attempted: bool,
    ) -> Result<bool, ScheduleStoreError> {
        let result = sqlx::query(&format!(
            "UPDATE scheduled_commands \
             SET final_attempt_time = $3, last_error = $4, attempts = attempts + $5 \
             WHERE aggregate_id = $1 AND sequence_number = $2 AND {UNRESOLVED}"
        ))
        .bind(key.aggregate_id.as_uuid())
        .bind(key.sequence_number as i64)
        .bind(at)
        .bind(error)
        .bind(i32::from(attempted))
        .execute(&self.pool)
        .await
        .map_err(|e| storage("mark_failed", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(key = %key), err)]
    async fn record_failed_attempt(
        &self,
        key: ScheduledCommandKey,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, ScheduleStoreError> {
        let result = sqlx::query(&format!(
            "UPDATE scheduled_commands \
             SET attempts = attempts + 1, last_error = $3, due_time = $4 \
             WHERE aggregate_id = $1 AND sequence_number = $2 AND {UNRESOLVED}"
        ))
        .bind(key.aggregate_id.as_uuid())
        .bind(key.sequence_number as i64)
        .bind(error)
        .bind(retry_at)
        .execute(&self.pool)
        .await
        .map_err(|e| storage("record_failed_attempt", e))?;
        Ok(result.rows_affected() == 1)
    }
}

fn bind_command<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    command: &'q ScheduledCommand,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(command.aggregate_id.as_uuid())
        .bind(command.sequence_number as i64)
        .bind(&command.aggregate_type)
        .bind(&command.command_name)
        .bind(&command.command)
        .bind(command.created_at)
        .bind(command.due_time)
        .bind(command.precondition.map(|p| *p.aggregate_id.as_uuid()))
        .bind(command.precondition.map(|p| p.sequence_number as i64))
        .bind(command.attempts as i32)
        .bind(&command.last_error)
        .bind(command.applied_time)
        .bind(command.final_attempt_time)
}

#[derive(Debug)]
struct ScheduledCommandRow {
    aggregate_id: uuid::Uuid,
    sequence_number: i64,
    aggregate_type: String,
    command_name: String,
    command: serde_json::Value,
    created_at: DateTime<Utc>,
    due_time: Option<DateTime<Utc>>,
    precondition_aggregate_id: Option<uuid::Uuid>,
    precondition_sequence_number: Option<i64>,
    attempts: i32,
    last_error: Option<String>,
    applied_time: Option<DateTime<Utc>>,
    final_attempt_time: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ScheduledCommandRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(ScheduledCommandRow {
            aggregate_id: row.try_get("aggregate_id")?,
            sequence_number: row.try_get("sequence_number")?,
            aggregate_type: row.try_get("aggregate_type")?,
            command_name: row.try_get("command_name")?,
            command: row.try_get("command")?,
            created_at: row.try_get("created_at")?,
            due_time: row.try_get("due_time")?,
            precondition_aggregate_id: row.try_get("precondition_aggregate_id")?,
            precondition_sequence_number: row.try_get("precondition_sequence_number")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            applied_time: row.try_get("applied_time")?,
            final_attempt_time: row.try_get("final_attempt_time")?,
        })
    }
}

impl From<ScheduledCommandRow> for ScheduledCommand {
    fn from(row: ScheduledCommandRow) -> Self {
        let precondition = row
            .precondition_aggregate_id
            .zip(row.precondition_sequence_number)
            .map(|(id, seq)| DeliveryPrecondition::event_exists(AggregateId::from_uuid(id), seq as u64));
        ScheduledCommand {
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number as u64,
            command_name: row.command_name,
            command: row.command,
            created_at: row.created_at,
            due_time: row.due_time,
            precondition,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            applied_time: row.applied_time,
            final_attempt_time: row.final_attempt_time,
        }
    }
}
