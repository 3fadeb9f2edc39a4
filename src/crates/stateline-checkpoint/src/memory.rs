//! In-memory checkpoint storage for development and testing
//!
//! [`InMemoryCheckpointStore`] keeps snapshots in an `Arc<RwLock<HashMap>>`.
//! It is ephemeral by construction - everything is lost when the process
//! exits - which is exactly right for unit tests, examples, and short-lived
//! workflows. Production deployments should implement
//! [`CheckpointStore`] over a real database instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::traits::CheckpointStore;

/// Thread-safe, process-local checkpoint store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCheckpointStore {
    entries: Arc<RwLock<HashMap<String, Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots currently held, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store holds no snapshots.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Remove every snapshot. Intended for test isolation.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(&self, id: &str, checkpoint: Checkpoint) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(id.to_string(), checkpoint);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Checkpoint>> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(id)
            .filter(|cp| !cp.expired_at(now))
            .cloned())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.entries.write().await.remove(id);
        Ok(())
    }

    async fn expire(&self) -> Result<usize> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, cp| !cp.expired_at(now));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Totals;
    use serde_json::json;

    fn checkpoint(name: &str, ttl_seconds: Option<u64>) -> Checkpoint {
        Checkpoint {
            name: name.to_string(),
            execution_id: "exec-1".to_string(),
            current_state: "Resume".to_string(),
            state: json!({"step": name}),
            trace: json!([]),
            totals: Totals { tokens: 42, cost: 0.01 },
            created_at: Utc::now(),
            ttl_seconds,
            compressed: false,
        }
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = InMemoryCheckpointStore::new();
        store.put("cp-1", checkpoint("cp-1", None)).await.unwrap();

        let loaded = store.get("cp-1").await.unwrap().unwrap();
        assert_eq!(loaded.current_state, "Resume");
        assert_eq!(loaded.totals.tokens, 42);
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.get("absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_replaces_existing() {
        let store = InMemoryCheckpointStore::new();
        store.put("cp-1", checkpoint("first", None)).await.unwrap();
        store.put("cp-1", checkpoint("second", None)).await.unwrap();

        let loaded = store.get("cp-1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "second");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryCheckpointStore::new();
        store.put("cp-1", checkpoint("cp-1", None)).await.unwrap();
        store.delete("cp-1").await.unwrap();
        store.delete("cp-1").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_expired_snapshot_is_invisible_and_expirable() {
        let store = InMemoryCheckpointStore::new();
        let mut cp = checkpoint("old", Some(60));
        cp.created_at = Utc::now() - chrono::Duration::hours(1);
        store.put("old", cp).await.unwrap();
        store.put("fresh", checkpoint("fresh", Some(3_600))).await.unwrap();

        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("fresh").await.unwrap().is_some());

        let removed = store.expire().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 1);
    }
}
