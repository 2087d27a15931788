//! The default, and currently only, [`StateStore`] implementation: a
//! `RwLock`-guarded map of maps. Fine for a single-process kernel; a
//! networked/durable store is a drop-in replacement behind the same trait.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::StateStore;

#[derive(Default)]
pub struct MemoryStateStore {
    collections: RwLock<HashMap<String, HashMap<String, Value>>>,
    counters: Mutex<HashMap<String, AtomicI64>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn upsert(&self, collection: &str, key: &str, value: Value) {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    async fn get(&self, collection: &str, key: &str) -> Option<Value> {
        let collections = self.collections.read().await;
        collections.get(collection)?.get(key).cloned()
    }

    async fn get_all(&self, collection: &str) -> Vec<(String, Value)> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    async fn delete(&self, collection: &str, key: &str) -> bool {
        let mut collections = self.collections.write().await;
        collections
            .get_mut(collection)
            .map(|m| m.remove(key).is_some())
            .unwrap_or(false)
    }

    async fn delete_range_before(
        &self,
        collection: &str,
        timestamp_field: &str,
        before: chrono::DateTime<chrono::Utc>,
    ) -> usize {
        let mut collections = self.collections.write().await;
        let Some(map) = collections.get_mut(collection) else {
            return 0;
        };
        let before_count = map.len();
        map.retain(|_, value| {
            let Some(ts) = value.get(timestamp_field).and_then(Value::as_str) else {
                return true;
            };
            match chrono::DateTime::parse_from_rfc3339(ts) {
                Ok(parsed) => parsed.with_timezone(&chrono::Utc) >= before,
                Err(_) => true,
            }
        });
        before_count - map.len()
    }

    async fn increment_counter(&self, name: &str, by: i64) -> i64 {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(name.to_string()).or_insert_with(|| AtomicI64::new(0));
        counter.fetch_add(by, Ordering::SeqCst) + by
    }

    async fn snapshot(&self) -> Value {
        let collections = self.collections.read().await;
        serde_json::to_value(&*collections).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = MemoryStateStore::new();
        store.upsert("skills", "summarize", serde_json::json!({ "name": "summarize" })).await;
        let value = store.get("skills", "summarize").await.unwrap();
        assert_eq!(value["name"], "summarize");
    }

    #[tokio::test]
    async fn get_all_returns_every_row_in_collection() {
        let store = MemoryStateStore::new();
        store.upsert("skills", "a", serde_json::json!({})).await;
        store.upsert("skills", "b", serde_json::json!({})).await;
        assert_eq!(store.get_all("skills").await.len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = MemoryStateStore::new();
        store.upsert("skills", "a", serde_json::json!({})).await;
        assert!(store.delete("skills", "a").await);
        assert!(store.get("skills", "a").await.is_none());
    }

    #[tokio::test]
    async fn counters_increment_monotonically() {
        let store = MemoryStateStore::new();
        assert_eq!(store.increment_counter("pid", 1).await, 1);
        assert_eq!(store.increment_counter("pid", 1).await, 2);
    }

    #[tokio::test]
    async fn delete_range_before_prunes_old_rows_only() {
        let store = MemoryStateStore::new();
        store
            .upsert("audit", "old", serde_json::json!({ "created_at": "2020-01-01T00:00:00Z" }))
            .await;
        store
            .upsert("audit", "new", serde_json::json!({ "created_at": "2030-01-01T00:00:00Z" }))
            .await;
        let cutoff = chrono::Utc::now();
        let pruned = store.delete_range_before("audit", "created_at", cutoff).await;
        assert_eq!(pruned, 1);
        assert!(store.get("audit", "new").await.is_some());
    }
}
