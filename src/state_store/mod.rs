//! Component B — the abstract state store.
//!
//! Every durable-ish piece of kernel state (process snapshots, skills, cron
//! jobs, triggers, webhook subscriptions/inbound hooks/delivery logs/DLQ,
//! audit rows, authorised keys, tunnels, templates, integrations + their
//! logs, agent memories/plans/profiles) goes through this trait rather than
//! talking to a concrete database directly — the kernel itself only ever
//! depends on `Arc<dyn StateStore>`. The only implementation shipped here
//! is in-memory, which is deliberate: the spec this models is explicit that
//! a concrete persistence engine is out of scope, so swapping in Postgres
//! or sqlite later is "implement this trait", not "rewrite the kernel".

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

/// Every persisted record is addressed by a namespace-scoped string key —
/// callers build the key (`"process:42"`, `"skill:summarize"`) the same way
/// the donor's cache layer does, instead of the store having to know every
/// domain type.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn upsert(&self, collection: &str, key: &str, value: Value);
    async fn get(&self, collection: &str, key: &str) -> Option<Value>;
    async fn get_all(&self, collection: &str) -> Vec<(String, Value)>;
    async fn delete(&self, collection: &str, key: &str) -> bool;

    /// Deletes every row in `collection` whose `timestamp_field` (an RFC
    /// 3339 string inside the stored JSON) falls before `before`. Used for
    /// audit-log and delivery-log retention pruning.
    async fn delete_range_before(
        &self,
        collection: &str,
        timestamp_field: &str,
        before: chrono::DateTime<chrono::Utc>,
    ) -> usize;

    /// Atomically increments a named counter and returns the new value —
    /// backs PID allocation and similar monotonic-id needs for stores that
    /// don't want to hand that logic to callers.
    async fn increment_counter(&self, name: &str, by: i64) -> i64;

    async fn snapshot(&self) -> Value;
}
