//! Write-only-forward record journal keyed by workflow (spec §4.3).
//!
//! Structurally grounded in
//! `weavegraph::runtimes::checkpointer_sqlite::SQLiteCheckpointer` (a thin
//! typed layer over a shared store, `save`/`load_latest`/`list`/`delete`
//! shaped methods); the record shape and retention default come from
//! `original_source/server/utils/checkpoint_manager.py::CheckpointManager`
//! (`save_checkpoint`, `get_latest_checkpoint`, `list_checkpoints`,
//! `cleanup_old_checkpoints`).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashSet;
use tracing::{instrument, warn};

use crate::errors::CheckpointError;
use crate::kv::KvStore;
use crate::state::CheckpointRecord;
use crate::types::CheckpointKind;

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Observability snapshot exposed through `GET health` (SPEC_FULL §2).
#[derive(Clone, Debug)]
pub struct CheckpointHealth {
    pub workflow_count: usize,
    pub record_count: usize,
    pub backend: &'static str,
}

/// Default retention window applied when `Save` is called without an
/// explicit `retain_until` (spec §4.3: "default `retain_until = now + 7
/// days`").
pub const DEFAULT_RETENTION: Duration = Duration::days(7);

fn record_key(workflow_id: &str, kind: CheckpointKind, timestamp: DateTime<Utc>) -> String {
    // iso-compact: strip punctuation so keys sort byte-lexicographically in
    // the same order as chronologically, matching spec §4.3's key scheme.
    let compact = timestamp.format("%Y%m%dT%H%M%S%.6f").to_string();
    format!("ckpt:{workflow_id}:{kind}:{compact}")
}

fn latest_pointer_key(workflow_id: &str) -> String {
    format!("ckpt:{workflow_id}:latest")
}

fn workflow_prefix(workflow_id: &str) -> String {
    format!("ckpt:{workflow_id}:")
}

/// The Checkpoint Store's public contract (spec §4.3).
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Writes `record` and (best-effort) updates the `latest` pointer.
    /// Returns the record's full storage key.
    async fn save(&self, record: &CheckpointRecord, ttl: Option<Duration>) -> Result<String>;

    /// Follows the `latest` pointer when present and non-dangling;
    /// otherwise falls back to a prefix scan (spec §4.3, P8).
    async fn load_latest(&self, workflow_id: &str) -> Result<Option<CheckpointRecord>>;

    /// Descending-timestamp records for `workflow_id`, optionally filtered
    /// by `kind`, capped at `limit`.
    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        kind: Option<CheckpointKind>,
        limit: usize,
    ) -> Result<Vec<CheckpointRecord>>;

    /// Page across every workflow's records, optionally filtered by `kind`.
    /// Returns `(page, total_count)`.
    async fn list_all(
        &self,
        page: usize,
        page_size: usize,
        kind: Option<CheckpointKind>,
    ) -> Result<(Vec<CheckpointRecord>, usize)>;

    /// Deletes records for `workflow_id`; if `kind` is `None`, also deletes
    /// the `latest` pointer. Returns the number of records deleted.
    async fn delete(&self, workflow_id: &str, kind: Option<CheckpointKind>) -> Result<usize>;

    /// Reap every record past its `retain_until` across all workflows
    /// (spec §4.3: "Expired records may be reaped opportunistically").
    /// Returns the number of records removed.
    async fn reap_expired(&self) -> Result<usize>;

    /// SPEC_FULL §2 supplement: workflow/record counts and the backing
    /// `store.backend`, composed into `Engine::health()`'s `GET health`
    /// response.
    async fn health(&self) -> Result<CheckpointHealth>;
}

/// `CheckpointStore` implemented over a shared [`KvStore`], using the
/// `ckpt:{workflow_id}:{kind}:{timestamp}` / `ckpt:{workflow_id}:latest` key
/// scheme from spec §4.3.
pub struct KvCheckpointStore {
    store: Arc<dyn KvStore>,
}

impl KvCheckpointStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    async fn read_record(&self, key: &str) -> Result<Option<CheckpointRecord>> {
        let raw = self.store.get(key).await.map_err(CheckpointError::Store)?;
        match raw {
            None => Ok(None),
            Some(bytes) => {
                let record: CheckpointRecord = serde_json::from_slice(&bytes)
                    .map_err(|e| CheckpointError::Schema(e.to_string()))?;
                Ok(Some(record))
            }
        }
    }

    async fn scan_workflow(&self, workflow_id: &str) -> Result<Vec<CheckpointRecord>> {
        let entries = self
            .store
            .scan(&workflow_prefix(workflow_id))
            .await
            .map_err(CheckpointError::Store)?;
        let mut records = Vec::with_capacity(entries.len());
        for (key, bytes) in entries {
            // The `latest` pointer lives under the same prefix but holds a
            // plain key string, not a CheckpointRecord; skip it.
            if key == latest_pointer_key(workflow_id) {
                continue;
            }
            match serde_json::from_slice::<CheckpointRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(%key, error = %e, "skipping malformed checkpoint record during scan"),
            }
        }
        Ok(records)
    }
}

#[async_trait::async_trait]
impl CheckpointStore for KvCheckpointStore {
    #[instrument(skip(self, record), fields(workflow_id = %record.workflow_id, kind = %record.kind))]
    async fn save(&self, record: &CheckpointRecord, ttl: Option<Duration>) -> Result<String> {
        let key = record_key(&record.workflow_id, record.kind, record.timestamp);
        let bytes = serde_json::to_vec(record).map_err(|e| CheckpointError::Schema(e.to_string()))?;
        let effective_ttl = ttl.or_else(|| {
            record
                .retain_until
                .map(|deadline| deadline - Utc::now())
                .or(Some(DEFAULT_RETENTION))
        });
        self.store
            .put(&key, bytes, effective_ttl)
            .await
            .map_err(CheckpointError::Store)?;
        // Pointer write follows the record write; spec §4.3 tolerates a
        // stale/dangling pointer, so a crash between the two is safe.
        self.store
            .put(&latest_pointer_key(&record.workflow_id), key.clone().into_bytes(), None)
            .await
            .map_err(CheckpointError::Store)?;
        Ok(key)
    }

    #[instrument(skip(self), fields(%workflow_id))]
    async fn load_latest(&self, workflow_id: &str) -> Result<Option<CheckpointRecord>> {
        if let Some(pointer_bytes) = self
            .store
            .get(&latest_pointer_key(workflow_id))
            .await
            .map_err(CheckpointError::Store)?
        {
            let pointer_key = String::from_utf8_lossy(&pointer_bytes).into_owned();
            if let Some(record) = self.read_record(&pointer_key).await? {
                return Ok(Some(record));
            }
            // Dangling pointer: fall through to the prefix scan (P8).
        }
        let mut records = self.scan_workflow(workflow_id).await?;
        records.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.checkpoint_id.cmp(&a.checkpoint_id))
        });
        Ok(records.into_iter().next())
    }

    #[instrument(skip(self), fields(%workflow_id, ?kind))]
    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        kind: Option<CheckpointKind>,
        limit: usize,
    ) -> Result<Vec<CheckpointRecord>> {
        let mut records = self.scan_workflow(workflow_id).await?;
        if let Some(kind) = kind {
            records.retain(|r| r.kind == kind);
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn list_all(
        &self,
        page: usize,
        page_size: usize,
        kind: Option<CheckpointKind>,
    ) -> Result<(Vec<CheckpointRecord>, usize)> {
        let entries = self.store.scan("ckpt:").await.map_err(CheckpointError::Store)?;
        let mut records = Vec::new();
        for (key, bytes) in entries {
            if key.ends_with(":latest") {
                continue;
            }
            if let Ok(record) = serde_json::from_slice::<CheckpointRecord>(&bytes) {
                if kind.is_none_or(|k| record.kind == k) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let total_count = records.len();
        let start = page.saturating_mul(page_size).min(total_count);
        let end = start.saturating_add(page_size).min(total_count);
        Ok((records[start..end].to_vec(), total_count))
    }

    #[instrument(skip(self), fields(%workflow_id, ?kind))]
    async fn delete(&self, workflow_id: &str, kind: Option<CheckpointKind>) -> Result<usize> {
        let records = self.scan_workflow(workflow_id).await?;
        let mut deleted = 0usize;
        for record in records {
            if kind.is_none_or(|k| record.kind == k) {
                let key = record_key(workflow_id, record.kind, record.timestamp);
                if self.store.delete(&key).await.map_err(CheckpointError::Store)? {
                    deleted += 1;
                }
            }
        }
        if kind.is_none() {
            self.store
                .delete(&latest_pointer_key(workflow_id))
                .await
                .map_err(CheckpointError::Store)?;
        }
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn reap_expired(&self) -> Result<usize> {
        let entries = self.store.scan("ckpt:").await.map_err(CheckpointError::Store)?;
        let now = Utc::now();
        let mut reaped = 0usize;
        for (key, bytes) in entries {
            if key.ends_with(":latest") {
                continue;
            }
            if let Ok(record) = serde_json::from_slice::<CheckpointRecord>(&bytes) {
                if record.retain_until.is_some_and(|deadline| deadline <= now)
                    && self.store.delete(&key).await.map_err(CheckpointError::Store)?
                {
                    reaped += 1;
                }
            }
        }
        Ok(reaped)
    }

    #[instrument(skip(self))]
    async fn health(&self) -> Result<CheckpointHealth> {
        let entries = self.store.scan("ckpt:").await.map_err(CheckpointError::Store)?;
        let mut workflow_ids = FxHashSet::default();
        let mut record_count = 0usize;
        for (key, bytes) in &entries {
            if key.ends_with(":latest") {
                continue;
            }
            record_count += 1;
            if let Ok(record) = serde_json::from_slice::<CheckpointRecord>(bytes) {
                workflow_ids.insert(record.workflow_id);
            }
        }
        Ok(CheckpointHealth {
            workflow_count: workflow_ids.len(),
            record_count,
            backend: self.store.backend_name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;
    use crate::state::WorkflowState;

    fn store() -> KvCheckpointStore {
        KvCheckpointStore::new(Arc::new(InMemoryKvStore::new()))
    }

    fn record(kind: CheckpointKind) -> CheckpointRecord {
        CheckpointRecord::new(kind, WorkflowState::new("kw", "trace-0001"), None)
    }

    #[tokio::test]
    async fn save_then_load_latest_roundtrips() {
        let store = store();
        let record = record(CheckpointKind::Initial);
        store.save(&record, None).await.unwrap();
        let loaded = store.load_latest(&record.workflow_id).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint_id, record.checkpoint_id);
    }

    #[tokio::test]
    async fn load_latest_falls_back_to_scan_on_dangling_pointer() {
        let store = store();
        let record = record(CheckpointKind::Initial);
        store.save(&record, None).await.unwrap();
        // Corrupt the pointer so it dangles.
        store
            .store
            .put(&latest_pointer_key(&record.workflow_id), b"ckpt:nope:missing".to_vec(), None)
            .await
            .unwrap();
        let loaded = store.load_latest(&record.workflow_id).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint_id, record.checkpoint_id);
    }

    #[tokio::test]
    async fn list_by_workflow_is_descending_and_kind_filtered() {
        let store = store();
        let workflow_id = {
            let r1 = record(CheckpointKind::Initial);
            let workflow_id = r1.workflow_id.clone();
            store.save(&r1, None).await.unwrap();
            let mut r2 = record(CheckpointKind::StageCompletion);
            r2.workflow_id = workflow_id.clone();
            r2.timestamp = r1.timestamp + Duration::seconds(1);
            store.save(&r2, None).await.unwrap();
            workflow_id
        };
        let all = store.list_by_workflow(&workflow_id, None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].timestamp >= all[1].timestamp);
        let filtered = store
            .list_by_workflow(&workflow_id, Some(CheckpointKind::Initial), 10)
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[tokio::test]
    async fn delete_without_kind_also_clears_latest_pointer() {
        let store = store();
        let record = record(CheckpointKind::Manual);
        store.save(&record, None).await.unwrap();
        let deleted = store.delete(&record.workflow_id, None).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.load_latest(&record.workflow_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reap_expired_removes_only_past_retention() {
        let store = store();
        let mut stale = record(CheckpointKind::Periodic);
        stale.retain_until = Some(Utc::now() - Duration::seconds(1));
        let mut fresh = record(CheckpointKind::Periodic);
        fresh.retain_until = Some(Utc::now() + Duration::days(1));
        store.save(&stale, Some(Duration::seconds(60))).await.unwrap();
        store.save(&fresh, None).await.unwrap();
        let reaped = store.reap_expired().await.unwrap();
        assert_eq!(reaped, 1);
    }

    #[tokio::test]
    async fn health_counts_distinct_workflows_and_records() {
        let store = store();
        let r1 = record(CheckpointKind::Initial);
        let workflow_id = r1.workflow_id.clone();
        store.save(&r1, None).await.unwrap();
        let mut r2 = record(CheckpointKind::StageCompletion);
        r2.workflow_id = workflow_id;
        store.save(&r2, None).await.unwrap();
        store.save(&record(CheckpointKind::Initial), None).await.unwrap();

        let health = store.health().await.unwrap();
        assert_eq!(health.record_count, 3);
        assert_eq!(health.workflow_count, 2);
        assert_eq!(health.backend, "embedded_kv");
    }
}
