//! Postgres-backed event store implementation.
//!
//! The `events` table's primary key `(aggregate_id, sequence_number)` is the
//! concurrency arbiter: two writers racing for the same position cannot both
//! commit. See [`crate::schema`] for the DDL.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `Conflict` (after reading the winning row) |
//! | Database (check constraint violation) | `23514` | `InvalidAppend` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network / other | N/A | `Storage` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, info, instrument};

use chronicle_core::AggregateId;

use super::r#trait::{
    ConcurrencyError, EventStore, EventStoreError, PendingEvent, StoredEvent, StreamRange,
    validate_batch,
};

const SELECT_EVENT_COLUMNS: &str = r#"
    SELECT
        event_id,
        aggregate_id,
        aggregate_type,
        sequence_number,
        event_type,
        actor,
        etag,
        occurred_at,
        payload
    FROM events
"#;

/// Postgres-backed append-only event store.
///
/// `PostgresEventStore` is `Send + Sync` and cheap to clone; all operations go
/// through the SQLx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn conflict(
        &self,
        aggregate_id: AggregateId,
        sequence_number: u64,
        attempted: &PendingEvent,
    ) -> EventStoreError {
        // The losing transaction is gone; read the winner with a fresh connection.
        let committed = match self.find_event(aggregate_id, sequence_number).await {
            Ok(found) => found.map(|e| e.authorship()),
            Err(_) => None,
        };
        let conflict = ConcurrencyError {
            aggregate_id,
            sequence_number,
            attempted: attempted.authorship(),
            committed,
        };
        info!(
            aggregate_id = %aggregate_id,
            sequence_number,
            "{conflict}"
        );
        conflict.into()
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    /// Append a contiguous batch inside one transaction.
    ///
    /// The stream's current version is read first so gaps are rejected and
    /// already-taken positions fail fast. A writer that commits between that
    /// read and the insert is caught by the primary key instead.
    #[instrument(
        skip(self, events),
        fields(
            event_count = events.len(),
            aggregate_id = tracing::field::Empty,
            first_sequence = tracing::field::Empty
        ),
        err
    )]
    async fn append(&self, events: Vec<PendingEvent>) -> Result<Vec<StoredEvent>, EventStoreError> {
        let (aggregate_id, aggregate_type, first_sequence) = validate_batch(&events)?;

        let span = Span::current();
        span.record("aggregate_id", tracing::field::display(aggregate_id));
        span.record("first_sequence", first_sequence);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let (current, existing_type) = check_stream_version(&mut tx, aggregate_id).await?;

        if let Some(existing_type) = existing_type {
            if existing_type != aggregate_type {
                rollback(tx).await?;
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{existing_type}', attempted append with '{aggregate_type}'"
                )));
            }
        }
        if first_sequence <= current {
            rollback(tx).await?;
            return Err(self.conflict(aggregate_id, first_sequence, &events[0]).await);
        }
        if first_sequence > current + 1 {
            rollback(tx).await?;
            return Err(EventStoreError::InvalidAppend(format!(
                "gap in stream {aggregate_id}: current version {current}, batch starts at {first_sequence}"
            )));
        }

        for event in &events {
            let inserted = sqlx::query(
                r#"
                INSERT INTO events (
                    event_id,
                    aggregate_id,
                    aggregate_type,
                    sequence_number,
                    event_type,
                    actor,
                    etag,
                    occurred_at,
                    payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(event.event_id)
            .bind(event.aggregate_id.as_uuid())
            .bind(&event.aggregate_type)
            .bind(event.sequence_number as i64)
            .bind(&event.event_type)
            .bind(&event.actor)
            .bind(&event.etag)
            .bind(event.occurred_at)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await;

            if let Err(e) = inserted {
                let unique = is_unique_violation(&e);
                rollback(tx).await?;
                if unique {
                    return Err(self.conflict(aggregate_id, first_sequence, &events[0]).await);
                }
                return Err(map_sqlx_error("insert_event", e));
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(events.into_iter().map(PendingEvent::into_stored).collect())
    }

    #[instrument(
        skip(self),
        fields(aggregate_id = %aggregate_id, event_count = tracing::field::Empty),
        err
    )]
    async fn read_stream(
        &self,
        aggregate_id: AggregateId,
        range: StreamRange,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let sql = format!(
            r#"{SELECT_EVENT_COLUMNS}
            WHERE aggregate_id = $1
                AND sequence_number > $2
                AND ($3::bigint IS NULL OR sequence_number <= $3)
                AND ($4::timestamptz IS NULL OR occurred_at <= $4)
            ORDER BY sequence_number ASC
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(aggregate_id.as_uuid())
            .bind(range.after_sequence as i64)
            .bind(range.max_sequence.map(|v| v as i64))
            .bind(range.max_timestamp)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("read_stream", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let stored = StoredEventRow::from_row(&row).map_err(|e| {
                EventStoreError::Storage(format!("failed to deserialize event row: {e}"))
            })?;
            events.push(stored.into());
        }

        Span::current().record("event_count", events.len());
        Ok(events)
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    async fn find_event(
        &self,
        aggregate_id: AggregateId,
        sequence_number: u64,
    ) -> Result<Option<StoredEvent>, EventStoreError> {
        let sql = format!(
            "{SELECT_EVENT_COLUMNS} WHERE aggregate_id = $1 AND sequence_number = $2"
        );

        let row = sqlx::query(&sql)
            .bind(aggregate_id.as_uuid())
            .bind(sequence_number as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_event", e))?;

        row.map(|row| {
            StoredEventRow::from_row(&row)
                .map(StoredEvent::from)
                .map_err(|e| EventStoreError::Storage(format!("failed to deserialize event row: {e}")))
        })
        .transpose()
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    async fn stream_version(&self, aggregate_id: AggregateId) -> Result<u64, EventStoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence_number), 0) AS current_version FROM events WHERE aggregate_id = $1",
        )
        .bind(aggregate_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stream_version", e))?;

        let version: i64 = row
            .try_get("current_version")
            .map_err(|e| EventStoreError::Storage(format!("failed to read current_version: {e}")))?;
        Ok(version as u64)
    }
}

async fn rollback(tx: Transaction<'_, Postgres>) -> Result<(), EventStoreError> {
    tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
}

/// Current version and aggregate type of a stream (`(0, None)` when missing).
async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: AggregateId,
) -> Result<(u64, Option<String>), EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(MAX(sequence_number), 0) AS current_version,
            MAX(aggregate_type) AS aggregate_type
        FROM events
        WHERE aggregate_id = $1
        "#,
    )
    .bind(aggregate_id.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current_version: i64 = row
        .try_get("current_version")
        .map_err(|e| EventStoreError::Storage(format!("failed to read current_version: {e}")))?;
    let aggregate_type: Option<String> = row
        .try_get("aggregate_type")
        .map_err(|e| EventStoreError::Storage(format!("failed to read aggregate_type: {e}")))?;

    Ok((current_version as u64, aggregate_type))
}

/// Map SQLx errors to `EventStoreError`.
///
/// Unique violations are handled by the caller, which needs to read the winning
/// row before it can build a `ConcurrencyError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => EventStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct StoredEventRow {
    event_id: uuid::Uuid,
    aggregate_id: uuid::Uuid,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    actor: Option<String>,
    etag: Option<String>,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            actor: row.try_get("actor")?,
            etag: row.try_get("etag")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        StoredEvent {
            event_id: row.event_id,
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number as u64,
            event_type: row.event_type,
            actor: row.actor,
            etag: row.etag,
            occurred_at: row.occurred_at,
            payload: row.payload,
        }
    }
}
