//! Snapshot persistence.
//!
//! A snapshot captures an aggregate's serialized state at a known version so
//! that loading can skip replaying the events it already reflects. Snapshots
//! are taken on demand and never rewritten; a newer version supersedes older
//! ones.

mod in_memory;
mod postgres;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use chronicle_core::AggregateId;

pub use in_memory::InMemorySnapshotStore;
pub use postgres::PostgresSnapshotStore;

/// Aggregate snapshot for fast rehydration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    /// Sequence number of the last event reflected in `state`.
    pub version: u64,
    /// When the event at `version` occurred. Needed to seed point-in-time loads.
    #[serde(default)]
    pub last_event_at: Option<DateTime<Utc>>,
    pub state: JsonValue,
    /// Per-event idempotency tokens of every event already reflected in `state`.
    pub etags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SnapshotStoreError {
    #[error("invalid snapshot: {0}")]
    Invalid(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The highest-version snapshot for an aggregate, if any.
    async fn latest(&self, aggregate_id: AggregateId) -> Result<Option<Snapshot>, SnapshotStoreError>;

    /// Store a snapshot. Writing a version that already exists is a no-op.
    async fn put(&self, snapshot: Snapshot) -> Result<(), SnapshotStoreError>;
}

#[async_trait]
impl<S> SnapshotStore for Arc<S>
where
    S: SnapshotStore + ?Sized,
{
    async fn latest(&self, aggregate_id: AggregateId) -> Result<Option<Snapshot>, SnapshotStoreError> {
        (**self).latest(aggregate_id).await
    }

    async fn put(&self, snapshot: Snapshot) -> Result<(), SnapshotStoreError> {
        (**self).put(snapshot).await
    }
}

fn validate(snapshot: &Snapshot) -> Result<(), SnapshotStoreError> {
    if snapshot.version == 0 {
        return Err(SnapshotStoreError::Invalid(format!(
            "snapshot of {} has version 0",
            snapshot.aggregate_id
        )));
    }
    Ok(())
}
