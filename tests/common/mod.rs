//! Shared test doubles for the supervisor's integration scenarios (spec §8).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use serde_json::{json, Value};
use wf_supervisor::agent::{Agent, AgentInput, AgentOutput};
use wf_supervisor::errors::AgentError;
use wf_supervisor::types::StageId;

/// Always succeeds with a fixed payload.
pub struct ConstantAgent {
    pub stage: StageId,
    pub output: Value,
}

#[async_trait]
impl Agent for ConstantAgent {
    fn stage(&self) -> StageId {
        self.stage
    }

    async fn process(&self, _input: &AgentInput) -> Result<AgentOutput, AgentError> {
        Ok(self.output.clone())
    }
}

/// Fails with `kTransient` on its first `flaky_calls` invocations, then
/// succeeds (spec §8 scenario 3).
pub struct TransientThenOkAgent {
    pub stage: StageId,
    pub flaky_calls: u32,
    calls: AtomicU32,
}

impl TransientThenOkAgent {
    pub fn new(stage: StageId, flaky_calls: u32) -> Self {
        Self {
            stage,
            flaky_calls,
            calls: AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for TransientThenOkAgent {
    fn stage(&self) -> StageId {
        self.stage
    }

    async fn process(&self, _input: &AgentInput) -> Result<AgentOutput, AgentError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.flaky_calls {
            Err(AgentError::Transient("not ready yet".to_string()))
        } else {
            Ok(json!({"ok": true}))
        }
    }
}

/// Fails every call with a non-retryable `Failure` until swapped out
/// (spec §8 scenario 2).
pub struct AlwaysFailsAgent {
    pub stage: StageId,
}

#[async_trait]
impl Agent for AlwaysFailsAgent {
    fn stage(&self) -> StageId {
        self.stage
    }

    async fn process(&self, _input: &AgentInput) -> Result<AgentOutput, AgentError> {
        Err(AgentError::Failure("extraction backend unavailable".to_string()))
    }
}

/// Sleeps `delay` before succeeding, to give a test room to call `Cancel`
/// mid-stage (spec §8 scenario 5).
pub struct SlowAgent {
    pub stage: StageId,
    pub delay: StdDuration,
}

#[async_trait]
impl Agent for SlowAgent {
    fn stage(&self) -> StageId {
        self.stage
    }

    async fn process(&self, _input: &AgentInput) -> Result<AgentOutput, AgentError> {
        tokio::time::sleep(self.delay).await;
        Ok(json!({"ok": true}))
    }
}

/// Registers a [`ConstantAgent`] for every workable stage except those
/// overridden by `overrides`.
pub fn register_constant_agents(engine: &Arc<wf_supervisor::engine::Engine>, skip: &[StageId]) {
    for stage in StageId::WORKABLE {
        if skip.contains(&stage) {
            continue;
        }
        engine.register_agent(Arc::new(ConstantAgent {
            stage,
            output: json!({"stage": stage.encode()}),
        }));
    }
}
