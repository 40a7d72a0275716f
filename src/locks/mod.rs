//! Leased, per-resource exclusive locks (spec §4.2).
//!
//! Grounded in `original_source/server/utils/lock_manager.py`'s
//! `DistributedLockManager`: a `LockInfo`-shaped lease record
//! (`resource_name`, `lock_id`, `ttl`, `acquired_at`, `is_expired`), a
//! background sweeper thread started from the constructor (there, a
//! `threading.Thread` on a 10s interval calling `cleanup_expired_locks`;
//! here, a `tokio::spawn`ed task on a `tokio::time::interval`), and an
//! operator-only `force_release` escape hatch. The acquire path implements
//! spec §4.2's "alternative in-KV implementation": a compare-and-set write
//! of `(lease_id, expires_at)` under `lock:{resource}`, serialized through a
//! single internal mutex per spec §5 ("Lock Manager internal state: guarded
//! by a single internal mutex; critical sections are O(1)").

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::errors::{KvError, LockError};
use crate::kv::KvStore;

pub type Result<T> = std::result::Result<T, LockError>;

/// How often the background sweeper purges expired lease bookkeeping (spec
/// §4.2: "a background sweeper runs every 10 seconds").
pub const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(10);

/// Base interval `acquire` polls at while waiting for a contended lock to
/// free up; jittered per-call to avoid a thundering herd of simultaneous
/// acquirers waking in lockstep.
const POLL_INTERVAL: StdDuration = StdDuration::from_millis(20);

fn jittered_poll_interval() -> StdDuration {
    use rand::Rng;
    let jitter_ms = rand::rng().random_range(0..=10);
    POLL_INTERVAL + StdDuration::from_millis(jitter_ms)
}

/// A timed exclusive claim on a named resource (spec §3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockLease {
    pub resource: String,
    pub lease_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

impl LockLease {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + Duration::seconds(self.ttl_seconds)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at() <= Utc::now()
    }
}

/// Observability snapshot exposed through `GET health` (SPEC_FULL §2).
#[derive(Clone, Debug, Default)]
pub struct LockHealth {
    pub active_lease_count: usize,
    pub last_sweep_at: Option<DateTime<Utc>>,
}

/// The Lock Manager's public contract (spec §4.2).
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Blocks up to `timeout` (zero for non-blocking). Returns immediately
    /// on success; never steals a held, non-expired lease.
    async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<LockLease>;

    /// Returns `false` if no matching active lease exists.
    async fn release(&self, resource: &str, lease_id: &str) -> Result<bool>;

    /// Fails if the lease is expired or `lease_id` mismatches.
    async fn extend(&self, resource: &str, lease_id: &str, additional_ttl: Duration) -> Result<bool>;

    async fn is_held(&self, resource: &str) -> Result<bool>;

    /// Operator escape hatch; logs a warning. MAY cause data loss if the
    /// holder is still active. Not used by the Engine in normal flow.
    async fn force_release(&self, resource: &str) -> Result<()>;

    fn health(&self) -> LockHealth;
}

fn lock_key(resource: &str) -> String {
    format!("lock:{resource}")
}

/// `LockManager` implemented as a compare-and-set write against a shared
/// [`KvStore`] (spec §4.2's "alternative in-KV implementation").
pub struct KvLockManager {
    store: Arc<dyn KvStore>,
    /// Serializes acquire/release/extend so the check-then-write sequence
    /// below is atomic within this process (spec §5: "guarded by a single
    /// internal mutex; critical sections are O(1)").
    guard: AsyncMutex<()>,
    last_sweep_at: Mutex<Option<DateTime<Utc>>>,
    active_resources: Mutex<rustc_hash::FxHashSet<String>>,
}

impl KvLockManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            guard: AsyncMutex::new(()),
            last_sweep_at: Mutex::new(None),
            active_resources: Mutex::new(rustc_hash::FxHashSet::default()),
        }
    }

    /// Spawn the 10s background sweeper described in spec §4.2, returning a
    /// handle for graceful shutdown. Grounded in
    /// `DistributedLockManager.__init__`'s cleanup thread.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                manager.sweep_once().await;
            }
        })
    }

    #[instrument(skip(self))]
    async fn sweep_once(&self) {
        let resources: Vec<String> = self.active_resources.lock().iter().cloned().collect();
        for resource in resources {
            match self.read_lease(&resource).await {
                Ok(Some(lease)) if lease.is_expired() => {
                    if let Err(err) = self.store.delete(&lock_key(&resource)).await {
                        warn!(%resource, %err, "sweeper failed to purge expired lease");
                    }
                    self.active_resources.lock().remove(&resource);
                }
                Ok(None) => {
                    self.active_resources.lock().remove(&resource);
                }
                _ => {}
            }
        }
        *self.last_sweep_at.lock() = Some(Utc::now());
    }

    async fn read_lease(&self, resource: &str) -> std::result::Result<Option<LockLease>, LockError> {
        let raw = self
            .store
            .get(&lock_key(resource))
            .await
            .map_err(|source| LockError::Store {
                resource: resource.to_string(),
                source,
            })?;
        match raw {
            None => Ok(None),
            Some(bytes) => {
                let lease: LockLease =
                    serde_json::from_slice(&bytes).map_err(|e| LockError::Store {
                        resource: resource.to_string(),
                        source: KvError::Serde(e),
                    })?;
                Ok(Some(lease))
            }
        }
    }

    async fn write_lease(&self, lease: &LockLease) -> std::result::Result<(), LockError> {
        let bytes = serde_json::to_vec(lease).map_err(|e| LockError::Store {
            resource: lease.resource.clone(),
            source: KvError::Serde(e),
        })?;
        self.store
            .put(&lock_key(&lease.resource), bytes, Some(Duration::seconds(lease.ttl_seconds)))
            .await
            .map_err(|source| LockError::Store {
                resource: lease.resource.clone(),
                source,
            })?;
        self.active_resources.lock().insert(lease.resource.clone());
        Ok(())
    }

    /// Single attempt to claim `resource`, returning `None` if it is
    /// currently held by a non-expired lease.
    async fn try_acquire_once(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> std::result::Result<Option<LockLease>, LockError> {
        let _held = self.guard.lock().await;
        if let Some(existing) = self.read_lease(resource).await? {
            if !existing.is_expired() {
                return Ok(None);
            }
        }
        let lease = LockLease {
            resource: resource.to_string(),
            lease_id: Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
            ttl_seconds: ttl.num_seconds(),
        };
        self.write_lease(&lease).await?;
        Ok(Some(lease))
    }
}

#[async_trait]
impl LockManager for KvLockManager {
    #[instrument(skip(self), fields(%resource, ttl_s = ttl.num_seconds(), timeout_ms = timeout.num_milliseconds()))]
    async fn acquire(&self, resource: &str, ttl: Duration, timeout: Duration) -> Result<LockLease> {
        let deadline = tokio::time::Instant::now()
            + timeout
                .to_std()
                .unwrap_or(StdDuration::ZERO);
        loop {
            if let Some(lease) = self.try_acquire_once(resource, ttl).await? {
                return Ok(lease);
            }
            if timeout <= Duration::zero() || tokio::time::Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    timeout_ms: timeout.num_milliseconds().max(0) as u64,
                });
            }
            tokio::time::sleep(jittered_poll_interval()).await;
        }
    }

    #[instrument(skip(self), fields(%resource))]
    async fn release(&self, resource: &str, lease_id: &str) -> Result<bool> {
        let _held = self.guard.lock().await;
        match self.read_lease(resource).await? {
            Some(existing) if existing.lease_id == lease_id => {
                self.store
                    .delete(&lock_key(resource))
                    .await
                    .map_err(|source| LockError::Store {
                        resource: resource.to_string(),
                        source,
                    })?;
                self.active_resources.lock().remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    #[instrument(skip(self), fields(%resource))]
    async fn extend(&self, resource: &str, lease_id: &str, additional_ttl: Duration) -> Result<bool> {
        let _held = self.guard.lock().await;
        match self.read_lease(resource).await? {
            Some(mut existing) if existing.lease_id == lease_id && !existing.is_expired() => {
                existing.ttl_seconds += additional_ttl.num_seconds();
                self.write_lease(&existing).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    #[instrument(skip(self), fields(%resource))]
    async fn is_held(&self, resource: &str) -> Result<bool> {
        Ok(self
            .read_lease(resource)
            .await?
            .is_some_and(|lease| !lease.is_expired()))
    }

    #[instrument(skip(self), fields(%resource))]
    async fn force_release(&self, resource: &str) -> Result<()> {
        warn!(%resource, "force_release invoked: may cause data loss if the holder is still active");
        let _held = self.guard.lock().await;
        self.store
            .delete(&lock_key(resource))
            .await
            .map_err(|source| LockError::Store {
                resource: resource.to_string(),
                source,
            })?;
        self.active_resources.lock().remove(resource);
        Ok(())
    }

    fn health(&self) -> LockHealth {
        LockHealth {
            active_lease_count: self.active_resources.lock().len(),
            last_sweep_at: *self.last_sweep_at.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    fn manager() -> KvLockManager {
        KvLockManager::new(Arc::new(InMemoryKvStore::new()))
    }

    #[tokio::test]
    async fn acquire_then_reacquire_times_out() {
        let manager = manager();
        let lease = manager
            .acquire("workflow:w1", Duration::seconds(30), Duration::zero())
            .await
            .unwrap();
        let err = manager
            .acquire("workflow:w1", Duration::seconds(30), Duration::milliseconds(50))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(manager.is_held("workflow:w1").await.unwrap());
        assert_eq!(lease.resource, "workflow:w1");
    }

    #[tokio::test]
    async fn release_requires_matching_lease_id() {
        let manager = manager();
        let lease = manager
            .acquire("r", Duration::seconds(30), Duration::zero())
            .await
            .unwrap();
        assert!(!manager.release("r", "not-the-id").await.unwrap());
        assert!(manager.release("r", &lease.lease_id).await.unwrap());
        assert!(!manager.is_held("r").await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_reacquired() {
        let manager = manager();
        manager
            .acquire("r", Duration::milliseconds(-1), Duration::zero())
            .await
            .unwrap();
        let second = manager
            .acquire("r", Duration::seconds(30), Duration::zero())
            .await
            .unwrap();
        assert_eq!(second.resource, "r");
    }

    #[tokio::test]
    async fn extend_fails_on_lease_id_mismatch() {
        let manager = manager();
        let lease = manager
            .acquire("r", Duration::seconds(30), Duration::zero())
            .await
            .unwrap();
        assert!(!manager.extend("r", "bogus", Duration::seconds(10)).await.unwrap());
        assert!(manager.extend("r", &lease.lease_id, Duration::seconds(10)).await.unwrap());
    }

    #[tokio::test]
    async fn force_release_clears_a_held_lock() {
        let manager = manager();
        manager
            .acquire("r", Duration::seconds(30), Duration::zero())
            .await
            .unwrap();
        manager.force_release("r").await.unwrap();
        assert!(!manager.is_held("r").await.unwrap());
    }
}
