//! Error taxonomy for the supervisor orchestration subsystem.
//!
//! The subsystem's contracts are expressed as error *kinds* rather than a
//! deep hierarchy of types: [`EngineError`] has one variant per kind named
//! in the component design, and the lower-level component errors
//! ([`KvError`], [`LockError`], [`CheckpointError`], [`AgentError`],
//! [`SchedulerError`]) convert into it via `#[from]`, mirroring how
//! `weavegraph::runtimes::runner::RunnerError` folds `CheckpointerError` and
//! `SchedulerError` into a single caller-facing enum.

use thiserror::Error;

#[cfg(feature = "diagnostics")]
use miette::Diagnostic;

/// Failure surfaced by the `KvStore` contract (spec §4.1).
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum KvError {
    #[error("store unavailable: {message}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(wf_supervisor::kv::unavailable))
    )]
    Unavailable { message: String },

    #[error("serialization error: {0}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(wf_supervisor::kv::serde)))]
    Serde(#[from] serde_json::Error),
}

/// Failure surfaced by the `LockManager` contract (spec §4.2).
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum LockError {
    #[error("lock acquisition for '{resource}' timed out after {timeout_ms}ms")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(
            code(wf_supervisor::lock::timeout),
            help("Another holder has not released or extended the lease yet.")
        )
    )]
    Timeout { resource: String, timeout_ms: u64 },

    #[error("underlying store failure while operating on lock '{resource}'")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(wf_supervisor::lock::store)))]
    Store {
        resource: String,
        #[source]
        source: KvError,
    },
}

/// Failure surfaced by the `CheckpointStore` contract (spec §4.3).
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum CheckpointError {
    #[error("no checkpoint found for workflow '{workflow_id}'")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(wf_supervisor::checkpoint::not_found))
    )]
    NotFound { workflow_id: String },

    #[error("underlying store failure while persisting a checkpoint")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(wf_supervisor::checkpoint::store))
    )]
    Store(#[from] KvError),

    #[error("checkpoint record failed schema validation: {0}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(wf_supervisor::checkpoint::schema))
    )]
    Schema(String),
}

/// Failure returned by an `Agent` implementation (spec §6.1).
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum AgentError {
    #[error("agent received invalid input: {0}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(wf_supervisor::agent::invalid_input))
    )]
    InvalidInput(String),

    #[error("agent failed: {0}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(wf_supervisor::agent::failed)))]
    Failure(String),

    #[error("agent reported a transient condition: {0}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(wf_supervisor::agent::transient))
    )]
    Transient(String),

    #[error("agent exceeded its deadline")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(wf_supervisor::agent::timeout)))]
    Timeout,

    #[error("infrastructure failure while running agent: {0}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(wf_supervisor::agent::infrastructure))
    )]
    Infrastructure(String),
}

impl AgentError {
    /// Whether the Retry Policy (spec §4.4) should retry this error kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Transient(_) | AgentError::Timeout | AgentError::Infrastructure(_)
        )
    }

    /// The stable `kXxx` kind name recorded in an `ErrorRecovery`
    /// checkpoint's metadata (spec §4.6 step 8).
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::InvalidInput(_) => "kInvalidInput",
            AgentError::Failure(_) => "kAgentFailure",
            AgentError::Transient(_) => "kTransient",
            AgentError::Timeout => "kTimeout",
            AgentError::Infrastructure(_) => "kInfrastructureFailure",
        }
    }
}

/// Failure surfaced by the periodic [`crate::scheduler::Scheduler`].
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum SchedulerError {
    #[error("scheduler task '{task}' failed: {message}")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(wf_supervisor::scheduler::task)))]
    TaskFailed { task: String, message: String },

    #[error("checkpoint store failure inside scheduler task '{task}'")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(wf_supervisor::scheduler::checkpoint))
    )]
    Checkpoint {
        task: String,
        #[source]
        source: CheckpointError,
    },
}

/// The closed error-kind taxonomy exposed by the Engine's public operations
/// (spec §7). Every variant here corresponds 1:1 to a `kXxx` kind named in
/// the specification.
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum EngineError {
    /// `kInvalidInput` — caller-provided value violates a precondition.
    #[error("invalid input: {0}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(wf_supervisor::engine::invalid_input))
    )]
    InvalidInput(String),

    /// `kNotFound` — referenced workflow/checkpoint absent.
    #[error("workflow '{0}' not found")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(wf_supervisor::engine::not_found)))]
    NotFound(String),

    /// `kAlreadyTerminal` — workflow is `Completed`/`failed`.
    #[error("workflow '{0}' is already terminal")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(wf_supervisor::engine::already_terminal))
    )]
    AlreadyTerminal(String),

    /// `kLockTimeout` — lock could not be acquired within the deadline.
    #[error("could not acquire lock for workflow '{0}' in time")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(wf_supervisor::engine::lock_timeout))
    )]
    LockTimeout(String),

    /// `kAgentFailure` — agent returned a non-retryable failure, or the
    /// retry budget was exhausted (`kRetryExhausted` is folded in here at
    /// the boundary, per spec §7).
    #[error("agent for stage '{stage}' failed: {message}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(wf_supervisor::engine::agent_failure))
    )]
    AgentFailure { stage: String, message: String },

    /// `kAgentMissing` — no agent registered for the current stage.
    #[error("no agent registered for stage '{0}'")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(wf_supervisor::engine::agent_missing))
    )]
    AgentMissing(String),

    /// `kInfrastructureFailure` — KV Store, lock subsystem, or checkpoint
    /// serialization failure.
    #[error("infrastructure failure: {0}")]
    #[cfg_attr(
        feature = "diagnostics",
        diagnostic(code(wf_supervisor::engine::infrastructure))
    )]
    Infrastructure(String),

    /// `kCancelled` — explicit cancellation observed.
    #[error("workflow '{0}' was cancelled")]
    #[cfg_attr(feature = "diagnostics", diagnostic(code(wf_supervisor::engine::cancelled)))]
    Cancelled(String),
}

impl EngineError {
    /// The stable `kXxx` kind name used in checkpoint metadata and, at a
    /// transport boundary, status-code mapping (spec §6.3).
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "kInvalidInput",
            EngineError::NotFound(_) => "kNotFound",
            EngineError::AlreadyTerminal(_) => "kAlreadyTerminal",
            EngineError::LockTimeout(_) => "kLockTimeout",
            EngineError::AgentFailure { .. } => "kAgentFailure",
            EngineError::AgentMissing(_) => "kAgentMissing",
            EngineError::Infrastructure(_) => "kInfrastructureFailure",
            EngineError::Cancelled(_) => "kCancelled",
        }
    }
}

impl From<LockError> for EngineError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { resource, .. } => EngineError::LockTimeout(resource),
            LockError::Store { resource, source } => {
                EngineError::Infrastructure(format!("lock store failure for {resource}: {source}"))
            }
        }
    }
}

impl From<CheckpointError> for EngineError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::NotFound { workflow_id } => EngineError::NotFound(workflow_id),
            other => EngineError::Infrastructure(other.to_string()),
        }
    }
}

impl From<KvError> for EngineError {
    fn from(err: KvError) -> Self {
        EngineError::Infrastructure(err.to_string())
    }
}
