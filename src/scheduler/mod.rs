//! Cooperative, single-process scheduler coordinating periodic and
//! event-driven checkpoints (spec §4.5).
//!
//! Grounded in `original_source/server/utils/scheduler.py::PeriodicScheduler`:
//! a `SchedulerTask{name, interval, enabled, next_run, last_run}` registry
//! driven by a single loop that wakes at most once a second
//! (`_scheduler_loop`), isolates task failures (`_run_task`'s try/except
//! resetting `next_run` regardless of outcome), and exposes the same two
//! default tasks (`periodic_snapshot`@60s, `cleanup_expired`@300s). `Start`/
//! `Stop` become an idempotent `tokio::spawn`/`JoinHandle` pair instead of
//! `asyncio.create_task`/cancel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::{error, info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::errors::SchedulerError;
use crate::state::WorkflowState;
use crate::types::CheckpointKind;

pub type Result<T> = std::result::Result<T, SchedulerError>;

const DRIVER_TICK: StdDuration = StdDuration::from_secs(1);

/// How long `stop()` waits for an in-flight task to finish before cancelling
/// the driver anyway (spec §4.5: "drains in-flight tasks with a bounded
/// deadline").
pub const SHUTDOWN_DRAIN: StdDuration = StdDuration::from_secs(5);

pub const PERIODIC_SNAPSHOT_INTERVAL: StdDuration = StdDuration::from_secs(60);
pub const CLEANUP_EXPIRED_INTERVAL: StdDuration = StdDuration::from_secs(300);

struct SchedulerTask {
    interval: StdDuration,
    enabled: bool,
    next_run: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
}

/// Snapshot of one registered task's scheduling state (spec §4.5's
/// `get_status`).
#[derive(Clone, Debug)]
pub struct TaskStatus {
    pub name: String,
    pub enabled: bool,
    pub interval_seconds: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
}

/// Overall scheduler status (spec §4.5, SPEC_FULL §2 health reporting).
#[derive(Clone, Debug)]
pub struct SchedulerStatus {
    pub running: bool,
    pub active_workflow_count: usize,
    pub tasks: Vec<TaskStatus>,
}

struct Inner {
    tasks: RwLock<HashMap<&'static str, SchedulerTask>>,
    active_workflows: RwLock<FxHashMap<String, WorkflowState>>,
    checkpoints: Arc<dyn CheckpointStore>,
    running: std::sync::atomic::AtomicBool,
    shutdown: Notify,
}

/// The periodic/event-driven checkpoint scheduler (spec §4.5).
pub struct Scheduler {
    inner: Arc<Inner>,
    driver: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>) -> Self {
        let mut tasks = HashMap::new();
        let now = Utc::now();
        tasks.insert(
            "periodic_snapshot",
            SchedulerTask {
                interval: PERIODIC_SNAPSHOT_INTERVAL,
                enabled: true,
                next_run: now + PERIODIC_SNAPSHOT_INTERVAL,
                last_run: None,
            },
        );
        tasks.insert(
            "cleanup_expired",
            SchedulerTask {
                interval: CLEANUP_EXPIRED_INTERVAL,
                enabled: true,
                next_run: now + CLEANUP_EXPIRED_INTERVAL,
                last_run: None,
            },
        );
        Self {
            inner: Arc::new(Inner {
                tasks: RwLock::new(tasks),
                active_workflows: RwLock::new(FxHashMap::default()),
                checkpoints,
                running: std::sync::atomic::AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
            driver: RwLock::new(None),
        }
    }

    /// Idempotent: spawns the driver loop if not already running.
    #[instrument(skip(self))]
    pub fn start(&self) {
        use std::sync::atomic::Ordering;
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already running");
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { Self::driver_loop(inner).await });
        *self.driver.write() = Some(handle);
        info!("scheduler started");
    }

    /// Idempotent: signals the driver loop to stop and waits up to
    /// [`SHUTDOWN_DRAIN`] for it to finish.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        use std::sync::atomic::Ordering;
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.notify_one();
        let handle = self.driver.write().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_DRAIN, handle).await.is_err() {
                warn!("scheduler driver did not drain within the shutdown deadline");
            }
        }
        info!("scheduler stopped");
    }

    pub fn register_workflow(&self, state: WorkflowState) {
        self.inner
            .active_workflows
            .write()
            .insert(state.workflow_id.clone(), state);
    }

    pub fn unregister_workflow(&self, workflow_id: &str) {
        self.inner.active_workflows.write().remove(workflow_id);
    }

    /// Keep the scheduler's in-memory mirror of a workflow current, e.g.
    /// after an `Advance` call. Does not itself checkpoint; stage-completion
    /// checkpoints flow through [`Scheduler::on_stage_completed`].
    pub fn update_workflow_state(&self, state: WorkflowState) {
        self.inner
            .active_workflows
            .write()
            .insert(state.workflow_id.clone(), state);
    }

    /// The Engine's synchronous `StageCompleted` hook (spec §4.5): writes a
    /// `StageCompletion` checkpoint. Idempotent with respect to the
    /// checkpoint journal — duplicate calls simply append another immutable
    /// record (P8).
    #[instrument(skip(self, state), fields(workflow_id = %state.workflow_id))]
    pub async fn on_stage_completed(&self, state: &WorkflowState) -> Result<()> {
        use crate::state::CheckpointRecord;
        let record = CheckpointRecord::new(CheckpointKind::StageCompletion, state.clone(), None);
        self.inner
            .checkpoints
            .save(&record, None)
            .await
            .map_err(|source| SchedulerError::Checkpoint {
                task: "on_stage_completed".to_string(),
                source,
            })?;
        self.update_workflow_state(state.clone());
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        use std::sync::atomic::Ordering;
        let tasks = self
            .inner
            .tasks
            .read()
            .iter()
            .map(|(name, task)| TaskStatus {
                name: (*name).to_string(),
                enabled: task.enabled,
                interval_seconds: task.interval.as_secs(),
                last_run: task.last_run,
                next_run: task.next_run,
            })
            .collect();
        SchedulerStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            active_workflow_count: self.inner.active_workflows.read().len(),
            tasks,
        }
    }

    async fn driver_loop(inner: Arc<Inner>) {
        info!("scheduler driver loop started");
        loop {
            tokio::select! {
                _ = inner.shutdown.notified() => break,
                _ = tokio::time::sleep(DRIVER_TICK) => {}
            }
            let due: Vec<&'static str> = {
                let tasks = inner.tasks.read();
                let now = Utc::now();
                tasks
                    .iter()
                    .filter(|(_, task)| task.enabled && task.next_run <= now)
                    .map(|(name, _)| *name)
                    .collect()
            };
            for name in due {
                Self::run_task(&inner, name).await;
            }
        }
        info!("scheduler driver loop stopped");
    }

    /// Runs one task to completion, isolating its failure: a failing task
    /// logs and still advances `next_run` (spec §4.5: "it does not halt the
    /// driver").
    async fn run_task(inner: &Arc<Inner>, name: &'static str) {
        let now = Utc::now();
        let result = match name {
            "periodic_snapshot" => Self::periodic_snapshot(inner).await,
            "cleanup_expired" => Self::cleanup_expired(inner).await,
            _ => Ok(()),
        };
        if let Err(err) = result {
            error!(task = name, %err, "scheduler task failed");
        }
        let mut tasks = inner.tasks.write();
        if let Some(task) = tasks.get_mut(name) {
            task.last_run = Some(now);
            task.next_run = now + task.interval;
        }
    }

    /// Caps how many `Save` calls run concurrently within one
    /// `periodic_snapshot` tick.
    const SNAPSHOT_CONCURRENCY: usize = 8;

    async fn periodic_snapshot(inner: &Arc<Inner>) -> Result<()> {
        use crate::state::CheckpointRecord;
        use futures_util::stream::{self, TryStreamExt};

        let workflows: Vec<WorkflowState> = inner.active_workflows.read().values().cloned().collect();
        if workflows.is_empty() {
            return Ok(());
        }
        let saved = workflows.len();
        // Independent workflows, independent keys (spec §4.3: "concurrent
        // writes for different keys are independent") — save them concurrently
        // rather than serializing on one slow write.
        stream::iter(workflows.into_iter().map(Ok::<_, SchedulerError>))
            .try_for_each_concurrent(Some(Self::SNAPSHOT_CONCURRENCY), |state| {
                let inner = Arc::clone(inner);
                async move {
                    let record = CheckpointRecord::new(CheckpointKind::Periodic, state, None);
                    inner
                        .checkpoints
                        .save(&record, None)
                        .await
                        .map(|_| ())
                        .map_err(|source| SchedulerError::Checkpoint {
                            task: "periodic_snapshot".to_string(),
                            source,
                        })
                }
            })
            .await?;
        info!(saved, "periodic snapshot complete");
        Ok(())
    }

    async fn cleanup_expired(inner: &Arc<Inner>) -> Result<()> {
        let reaped = inner
            .checkpoints
            .reap_expired()
            .await
            .map_err(|source| SchedulerError::Checkpoint {
                task: "cleanup_expired".to_string(),
                source,
            })?;
        if reaped > 0 {
            info!(reaped, "expired checkpoint reap complete");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::KvCheckpointStore;
    use crate::kv::InMemoryKvStore;
    use crate::types::CheckpointKind;

    fn scheduler() -> Scheduler {
        let kv = Arc::new(InMemoryKvStore::new());
        Scheduler::new(Arc::new(KvCheckpointStore::new(kv)))
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let scheduler = scheduler();
        scheduler.start();
        scheduler.start();
        assert!(scheduler.status().running);
        scheduler.stop().await;
        assert!(!scheduler.status().running);
    }

    #[tokio::test]
    async fn on_stage_completed_writes_a_checkpoint() {
        let scheduler = scheduler();
        let state = WorkflowState::new("kw", "trace-0001");
        let workflow_id = state.workflow_id.clone();
        scheduler.on_stage_completed(&state).await.unwrap();
        let records = scheduler
            .inner
            .checkpoints
            .list_by_workflow(&workflow_id, Some(CheckpointKind::StageCompletion), 10)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn register_and_unregister_workflow_tracks_active_count() {
        let scheduler = scheduler();
        let state = WorkflowState::new("kw", "trace-0001");
        let workflow_id = state.workflow_id.clone();
        scheduler.register_workflow(state);
        assert_eq!(scheduler.status().active_workflow_count, 1);
        scheduler.unregister_workflow(&workflow_id);
        assert_eq!(scheduler.status().active_workflow_count, 0);
    }
}
