use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use chronicle_core::AggregateId;

use super::{Snapshot, SnapshotStore, SnapshotStoreError, validate};

/// In-memory snapshot store (tests/dev).
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<AggregateId, BTreeMap<u64, Snapshot>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored version for an aggregate, ascending.
    pub fn versions(&self, aggregate_id: AggregateId) -> Vec<u64> {
        self.snapshots
            .read()
            .map(|s| {
                s.get(&aggregate_id)
                    .map(|by_version| by_version.keys().copied().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Replace the stored state of an existing snapshot. Test hook for
    /// simulating snapshots written by an incompatible build.
    #[cfg(test)]
    pub(crate) fn corrupt(&self, aggregate_id: AggregateId, version: u64, state: serde_json::Value) {
        if let Ok(mut snapshots) = self.snapshots.write() {
            if let Some(snapshot) = snapshots
                .get_mut(&aggregate_id)
                .and_then(|by_version| by_version.get_mut(&version))
            {
                snapshot.state = state;
            }
        }
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn latest(&self, aggregate_id: AggregateId) -> Result<Option<Snapshot>, SnapshotStoreError> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| SnapshotStoreError::Storage("lock poisoned".to_string()))?;

        Ok(snapshots
            .get(&aggregate_id)
            .and_then(|by_version| by_version.last_key_value())
            .map(|(_, snapshot)| snapshot.clone()))
    }

    async fn put(&self, snapshot: Snapshot) -> Result<(), SnapshotStoreError> {
        validate(&snapshot)?;

        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| SnapshotStoreError::Storage("lock poisoned".to_string()))?;

        snapshots
            .entry(snapshot.aggregate_id)
            .or_default()
            .entry(snapshot.version)
            .or_insert(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn snapshot(id: AggregateId, version: u64, marker: &str) -> Snapshot {
        Snapshot {
            aggregate_id: id,
            aggregate_type: "order".to_string(),
            version,
            last_event_at: None,
            state: json!({ "marker": marker }),
            etags: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn latest_is_highest_version() {
        let store = InMemorySnapshotStore::new();
        let id = AggregateId::new();
        store.put(snapshot(id, 4, "four")).await.unwrap();
        store.put(snapshot(id, 9, "nine")).await.unwrap();
        store.put(snapshot(id, 6, "six")).await.unwrap();

        let latest = store.latest(id).await.unwrap().unwrap();
        assert_eq!(latest.version, 9);
        assert_eq!(store.versions(id), vec![4, 6, 9]);
    }

    #[tokio::test]
    async fn written_snapshots_are_never_replaced() {
        let store = InMemorySnapshotStore::new();
        let id = AggregateId::new();
        store.put(snapshot(id, 3, "original")).await.unwrap();
        store.put(snapshot(id, 3, "rewrite")).await.unwrap();

        let latest = store.latest(id).await.unwrap().unwrap();
        assert_eq!(latest.state, json!({ "marker": "original" }));
    }

    #[tokio::test]
    async fn version_zero_is_rejected() {
        let store = InMemorySnapshotStore::new();
        let err = store.put(snapshot(AggregateId::new(), 0, "x")).await.unwrap_err();
        assert!(matches!(err, SnapshotStoreError::Invalid(_)));
    }
}
