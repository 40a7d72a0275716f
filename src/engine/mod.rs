//! The Supervisor: the stateful engine driving one `WorkflowState` through
//! the fixed DAG (spec §4.6).
//!
//! Structurally grounded in `weavegraph::runtimes::runner::AppRunner`'s
//! step-execution shape (load state, run one unit of work, persist, report)
//! and in `node.rs`'s fatal/recoverable split; the stage-by-stage
//! lock/load/select/resolve/build/invoke/commit/release algorithm and its
//! error-kind mapping are a direct port of
//! `original_source/src/agents/supervisor/agent.py::SupervisorAgent.execute_workflow`'s
//! per-step loop, generalized from string-named steps to the compile-time
//! [`StageId`] DAG.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use rustc_hash::FxHashMap;
use serde_json::json;
use tracing::{instrument, warn};

use crate::agent::Agent;
use crate::checkpoint::{CheckpointHealth, CheckpointStore, KvCheckpointStore};
use crate::config::{Config, StoreBackend};
use crate::errors::{EngineError, LockError};
use crate::kv::{InMemoryKvStore, KvStore};
use crate::locks::{KvLockManager, LockHealth, LockManager};
use crate::scheduler::{Scheduler, SchedulerStatus};
use crate::state::{CheckpointRecord, WorkflowState};
use crate::types::{CheckpointKind, StageId};

pub type Result<T> = std::result::Result<T, EngineError>;

/// The safety margin subtracted from the lock TTL when deriving an agent
/// invocation's deadline (spec §5: "a deadline derived from the lock TTL
/// minus a small safety margin").
const AGENT_DEADLINE_SAFETY_MARGIN: StdDuration = StdDuration::from_secs(2);

fn lock_resource(workflow_id: &str) -> String {
    format!("workflow:{workflow_id}")
}

/// Aggregate readiness snapshot for `GET health` (spec §6.3).
#[derive(Clone, Debug)]
pub struct EngineHealth {
    pub scheduler: SchedulerStatus,
    pub lock_manager: LockHealth,
    pub checkpoint_store: CheckpointHealth,
    pub registered_stages: usize,
}

/// The Supervisor orchestration engine (spec §4.6).
pub struct Engine {
    config: Config,
    locks: Arc<KvLockManager>,
    checkpoints: Arc<dyn CheckpointStore>,
    scheduler: Arc<Scheduler>,
    retry: crate::retry::RetryPolicy,
    agents: parking_lot::RwLock<FxHashMap<StageId, Arc<dyn Agent>>>,
    cancellations: parking_lot::Mutex<FxHashMap<String, Arc<AtomicBool>>>,
    _sweeper: tokio::task::JoinHandle<()>,
}

impl Engine {
    /// Wire the Engine over an already-constructed [`KvStore`] (spec §4.1's
    /// Lock Manager and Checkpoint Store both "build on" the same store).
    pub fn new(kv: Arc<dyn KvStore>, config: Config) -> Arc<Self> {
        let locks = Arc::new(KvLockManager::new(Arc::clone(&kv)));
        let sweeper = locks.spawn_sweeper();
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(KvCheckpointStore::new(kv));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&checkpoints)));
        let retry = crate::retry::RetryPolicy::new(config.retry_max_attempts, config.retry_base_delay);
        Arc::new(Self {
            config,
            locks,
            checkpoints,
            scheduler,
            retry,
            agents: parking_lot::RwLock::new(FxHashMap::default()),
            cancellations: parking_lot::Mutex::new(FxHashMap::default()),
            _sweeper: sweeper,
        })
    }

    /// Resolve `config.store_backend` into a concrete [`KvStore`] and build
    /// an Engine over it (spec §6.4).
    pub async fn connect(config: Config) -> Result<Arc<Self>> {
        let kv: Arc<dyn KvStore> = match config.store_backend {
            StoreBackend::EmbeddedKv => InMemoryKvStore::shared(),
            #[cfg(feature = "sqlite")]
            StoreBackend::LocalFile => Arc::new(
                crate::kv::sqlite::SqliteKvStore::connect(&config.sqlite_database_url)
                    .await
                    .map_err(EngineError::from)?,
            ),
            #[cfg(not(feature = "sqlite"))]
            StoreBackend::LocalFile => {
                return Err(EngineError::Infrastructure(
                    "store.backend = local_file requires the 'sqlite' feature".to_string(),
                ));
            }
            StoreBackend::External => {
                return Err(EngineError::Infrastructure(
                    "store.backend = external is not implemented by this crate".to_string(),
                ));
            }
        };
        Ok(Self::new(kv, config))
    }

    pub fn start_scheduler(&self) {
        self.scheduler.start();
    }

    pub async fn stop_scheduler(&self) {
        self.scheduler.stop().await;
    }

    /// `RegisterAgent(stage, agent)` (spec §4.6).
    pub fn register_agent(&self, agent: Arc<dyn Agent>) {
        self.agents.write().insert(agent.stage(), agent);
    }

    /// `Start(keyword, trace_id) -> workflow_id` (spec §4.6).
    #[instrument(skip(self))]
    pub async fn start(&self, keyword: &str, trace_id: &str) -> Result<String> {
        if keyword.trim().is_empty() {
            return Err(EngineError::InvalidInput("keyword must be non-empty".to_string()));
        }
        if trace_id.len() < 8 {
            return Err(EngineError::InvalidInput(
                "trace_id must be at least 8 characters".to_string(),
            ));
        }
        let state = WorkflowState::new(keyword, trace_id);
        let workflow_id = state.workflow_id.clone();
        let record = CheckpointRecord::new(CheckpointKind::Initial, state.clone(), None);
        self.checkpoints.save(&record, None).await?;
        self.scheduler.register_workflow(state);
        Ok(workflow_id)
    }

    /// `Get(workflow_id) -> WorkflowState` (spec §4.6): reads via the
    /// Checkpoint Store, no lock required.
    #[instrument(skip(self))]
    pub async fn get(&self, workflow_id: &str) -> Result<WorkflowState> {
        self.checkpoints
            .load_latest(workflow_id)
            .await?
            .map(|record| record.state)
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))
    }

    /// `Advance(workflow_id) -> WorkflowState`, non-blocking on lock
    /// acquisition (spec §4.6 step 1's `timeout = 0` default).
    pub async fn advance(&self, workflow_id: &str) -> Result<WorkflowState> {
        self.advance_with_timeout(workflow_id, Duration::zero()).await
    }

    /// `Advance` with a caller-supplied lock acquisition timeout (spec §4.6
    /// step 1: "`timeout = 0` (non-blocking) or caller-provided").
    #[instrument(skip(self))]
    pub async fn advance_with_timeout(&self, workflow_id: &str, lock_timeout: Duration) -> Result<WorkflowState> {
        let resource = lock_resource(workflow_id);
        let lease = self
            .locks
            .acquire(&resource, Duration::seconds(self.config.lock_default_ttl.as_secs() as i64), lock_timeout)
            .await
            .map_err(EngineError::from)?;
        let result = self.advance_locked(workflow_id).await;
        if let Err(err) = self.locks.release(&resource, &lease.lease_id).await {
            warn!(%workflow_id, %err, "failed to release workflow lock after advance");
        }
        result
    }

    async fn advance_locked(&self, workflow_id: &str) -> Result<WorkflowState> {
        let mut state = self.get(workflow_id).await?;
        if state.is_terminal() {
            return Err(EngineError::AlreadyTerminal(workflow_id.to_string()));
        }
        if self.take_cancellation(workflow_id) {
            return self.finish_cancelled(state).await;
        }

        let stage = state.current_stage;
        let agent = self
            .agents
            .read()
            .get(&stage)
            .cloned()
            .ok_or_else(|| EngineError::AgentMissing(stage.to_string()))?;

        let deadline = self
            .config
            .lock_default_ttl
            .checked_sub(AGENT_DEADLINE_SAFETY_MARGIN)
            .unwrap_or(StdDuration::from_millis(100));
        let input = state.clone();
        let outcome = self
            .retry
            .run(|_attempt| {
                let agent = Arc::clone(&agent);
                let input = input.clone();
                async move {
                    match tokio::time::timeout(deadline, agent.process(&input)).await {
                        Ok(result) => result,
                        Err(_) => Err(crate::errors::AgentError::Timeout),
                    }
                }
            })
            .await;

        if self.take_cancellation(workflow_id) {
            return self.finish_cancelled(state).await;
        }

        match outcome.into_result() {
            Ok(output) => {
                state.complete_stage(stage, output);
                // Every completed stage gets a StageCompletion record (spec §8
                // scenario 1: "ListByWorkflow(W, StageCompletion) returns 6
                // records"); reaching Completed additionally gets a Final
                // record marking the journal's terminal entry.
                if let Err(err) = self.scheduler.on_stage_completed(&state).await {
                    warn!(%workflow_id, %err, "scheduler failed to record stage completion checkpoint");
                }
                if state.is_completed() {
                    let record = CheckpointRecord::new(CheckpointKind::Final, state.clone(), None);
                    self.checkpoints.save(&record, None).await?;
                    self.scheduler.unregister_workflow(workflow_id);
                }
                Ok(state)
            }
            Err(agent_error) => {
                state.fail_stage(stage);
                let mut metadata = FxHashMap::default();
                metadata.insert("error_kind".to_string(), json!(agent_error.kind()));
                metadata.insert("message".to_string(), json!(agent_error.to_string()));
                let record =
                    CheckpointRecord::new(CheckpointKind::ErrorRecovery, state.clone(), None).with_metadata(metadata);
                self.checkpoints.save(&record, None).await?;
                Err(EngineError::AgentFailure {
                    stage: stage.to_string(),
                    message: agent_error.to_string(),
                })
            }
        }
    }

    /// `Run(workflow_id) -> WorkflowState`: repeatedly `Advance`s until
    /// `Completed` or an error (spec §4.6).
    #[instrument(skip(self))]
    pub async fn run(&self, workflow_id: &str) -> Result<WorkflowState> {
        loop {
            let state = self.advance(workflow_id).await?;
            if state.is_completed() {
                return Ok(state);
            }
        }
    }

    /// `Cancel(workflow_id) -> bool` (spec §4.6, §5): idempotent after
    /// terminal. If the workflow is uncontended, marks it `failed`
    /// immediately; otherwise flags the in-flight advancer to self-cancel.
    #[instrument(skip(self))]
    pub async fn cancel(&self, workflow_id: &str) -> Result<bool> {
        self.signal_cancellation(workflow_id);
        let resource = lock_resource(workflow_id);
        match self
            .locks
            .acquire(&resource, Duration::seconds(self.config.lock_default_ttl.as_secs() as i64), Duration::zero())
            .await
        {
            Ok(lease) => {
                let result = self.cancel_locked(workflow_id).await;
                if let Err(err) = self.locks.release(&resource, &lease.lease_id).await {
                    warn!(%workflow_id, %err, "failed to release workflow lock after cancel");
                }
                result
            }
            // Someone else holds the lock (likely an in-flight Advance); the
            // cancellation flag set above will be observed by that advancer.
            Err(LockError::Timeout { .. }) => Ok(true),
            Err(other) => Err(other.into()),
        }
    }

    async fn cancel_locked(&self, workflow_id: &str) -> Result<bool> {
        let state = self.get(workflow_id).await?;
        if state.is_terminal() {
            return Ok(true);
        }
        self.finish_cancelled(state).await.map(|_| true)
    }

    async fn finish_cancelled(&self, mut state: WorkflowState) -> Result<WorkflowState> {
        let stage = state.current_stage;
        state.mark_cancelled(stage);
        let mut metadata = FxHashMap::default();
        metadata.insert("cancelled".to_string(), json!(true));
        let record =
            CheckpointRecord::new(CheckpointKind::ErrorRecovery, state.clone(), None).with_metadata(metadata);
        self.checkpoints.save(&record, None).await?;
        self.scheduler.unregister_workflow(&state.workflow_id);
        Err(EngineError::Cancelled(state.workflow_id))
    }

    fn signal_cancellation(&self, workflow_id: &str) {
        self.cancellations
            .lock()
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .store(true, Ordering::SeqCst);
    }

    /// Reads and clears the cancellation flag for `workflow_id`, so the
    /// token is consumed on observation (spec §5: "check the token before
    /// and after the agent invocation and after retries").
    fn take_cancellation(&self, workflow_id: &str) -> bool {
        match self.cancellations.lock().get(workflow_id) {
            Some(flag) => flag.swap(false, Ordering::SeqCst),
            None => false,
        }
    }

    #[instrument(skip(self))]
    pub async fn list_checkpoints(
        &self,
        workflow_id: &str,
        kind: Option<CheckpointKind>,
        limit: usize,
    ) -> Result<Vec<CheckpointRecord>> {
        Ok(self.checkpoints.list_by_workflow(workflow_id, kind, limit).await?)
    }

    #[instrument(skip(self))]
    pub async fn delete_checkpoints(&self, workflow_id: &str, kind: Option<CheckpointKind>) -> Result<usize> {
        Ok(self.checkpoints.delete(workflow_id, kind).await?)
    }

    pub async fn health(&self) -> Result<EngineHealth> {
        Ok(EngineHealth {
            scheduler: self.scheduler.status(),
            lock_manager: self.locks.health(),
            checkpoint_store: self.checkpoints.health().await?,
            registered_stages: self.agents.read().len(),
        })
    }
}
