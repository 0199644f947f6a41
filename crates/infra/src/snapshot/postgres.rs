use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use chronicle_core::AggregateId;

use super::{Snapshot, SnapshotStore, SnapshotStoreError, validate};

/// Postgres-backed snapshot store. Rows are append-only; the latest is the
/// highest `version`.
#[derive(Debug, Clone)]
pub struct PostgresSnapshotStore {
    pool: PgPool,
}

impl PostgresSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    #[instrument(
        skip(self),
        fields(aggregate_id = %aggregate_id, snapshot_version = tracing::field::Empty),
        err
    )]
    async fn latest(&self, aggregate_id: AggregateId) -> Result<Option<Snapshot>, SnapshotStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                aggregate_id,
                aggregate_type,
                version,
                last_event_at,
                state,
                etags,
                created_at
            FROM snapshots
            WHERE aggregate_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SnapshotStoreError::Storage(format!("load_snapshot: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let row = SnapshotRow::from_row(&row)
            .map_err(|e| SnapshotStoreError::Storage(format!("failed to deserialize snapshot row: {e}")))?;
        Span::current().record("snapshot_version", row.version);
        row.try_into().map(Some)
    }

    #[instrument(
        skip(self, snapshot),
        fields(aggregate_id = %snapshot.aggregate_id, version = snapshot.version),
        err
    )]
    async fn put(&self, snapshot: Snapshot) -> Result<(), SnapshotStoreError> {
        validate(&snapshot)?;
        let etags = serde_json::to_value(&snapshot.etags)
            .map_err(|e| SnapshotStoreError::Invalid(format!("etags are not serializable: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO snapshots (
                aggregate_id,
                aggregate_type,
                version,
                last_event_at,
                state,
                etags,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (aggregate_id, version) DO NOTHING
            "#,
        )
        .bind(snapshot.aggregate_id.as_uuid())
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.version as i64)
        .bind(snapshot.last_event_at)
        .bind(&snapshot.state)
        .bind(&etags)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SnapshotStoreError::Storage(format!("store_snapshot: {e}")))?;

        Ok(())
    }
}

#[derive(Debug)]
struct SnapshotRow {
    aggregate_id: uuid::Uuid,
    aggregate_type: String,
    version: i64,
    last_event_at: Option<DateTime<Utc>>,
    state: serde_json::Value,
    etags: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SnapshotRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(SnapshotRow {
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            version: row.try_get("version")?,
            last_event_at: row.try_get("last_event_at")?,
            state: row.try_get("state")?,
            etags: row.try_get("etags")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = SnapshotStoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        let etags: BTreeSet<String> = serde_json::from_value(row.etags)
            .map_err(|e| SnapshotStoreError::Storage(format!("malformed etags column: {e}")))?;
        Ok(Snapshot {
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            version: row.version as u64,
            last_event_at: row.last_event_at,
            state: row.state,
            etags,
            created_at: row.created_at,
        })
    }
}
