//! `WorkflowState` and `CheckpointRecord`: the data model owned exclusively
//! by the [`crate::engine::Engine`] (spec §3).
//!
//! Grounded in `original_source/server/schemas/base.py`'s `WorkflowState`
//! and `CheckpointData` Pydantic models: the field names below are a
//! direct, typed port of that schema (`research_completed` etc. become
//! entries of [`StageFlags`] rather than six separate booleans, since the
//! set of stages is already a compile-time enumeration via [`StageId`]).

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{CheckpointKind, StageId};

/// Current lifecycle phase of a single stage within a workflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// The schema version embedded in persisted [`WorkflowState`] and
/// [`CheckpointRecord`] values (spec §6.2: "Record serialization MUST be
/// self-describing").
pub const SCHEMA_VERSION: u32 = 1;

/// The single source of truth for a workflow's progress (spec §3).
///
/// All mutation of this type happens exclusively inside
/// [`crate::engine::Engine`], under the workflow's lock; every other
/// component treats it as read-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub workflow_id: String,
    pub trace_id: String,
    pub keyword: String,
    pub current_stage: StageId,
    pub stage_flags: FxHashMap<StageId, StageStatus>,
    pub stage_outputs: FxHashMap<StageId, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_processing_seconds: Option<f64>,
    /// Set exclusively by [`WorkflowState::mark_cancelled`] (the `Cancel`
    /// operation's terminal path, spec §4.6). Distinct from an ordinary
    /// per-stage `Failed` flag, which leaves the workflow resumable via
    /// `Advance`/`Run` once the failing agent is fixed.
    #[serde(default)]
    pub cancelled: bool,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl WorkflowState {
    /// `Start(keyword, trace_id)` (spec §4.6). Callers must validate
    /// preconditions (`keyword` non-empty, `trace_id` >= 8 chars) before
    /// calling this constructor; see [`crate::engine::Engine::start`].
    pub fn new(keyword: impl Into<String>, trace_id: impl Into<String>) -> Self {
        let now = Utc::now();
        let mut stage_flags = FxHashMap::default();
        for stage in StageId::WORKABLE {
            stage_flags.insert(stage, StageStatus::Pending);
        }
        Self {
            schema_version: SCHEMA_VERSION,
            workflow_id: Uuid::new_v4().to_string(),
            trace_id: trace_id.into(),
            keyword: keyword.into(),
            current_stage: StageId::Research,
            stage_flags,
            stage_outputs: FxHashMap::default(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            total_processing_seconds: None,
            cancelled: false,
        }
    }

    pub fn stage_status(&self, stage: StageId) -> StageStatus {
        self.stage_flags
            .get(&stage)
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    /// A stage merely being `Failed` does NOT make the workflow terminal —
    /// `Advance`/`Run` must still be able to re-invoke a swapped-in agent for
    /// that stage (spec §4.6 recovery semantics, §8 scenario 2). Only
    /// reaching `Completed` or an explicit [`WorkflowState::mark_cancelled`]
    /// call ends the workflow for good.
    pub fn is_terminal(&self) -> bool {
        self.current_stage == StageId::Completed || self.cancelled
    }

    pub fn is_completed(&self) -> bool {
        self.current_stage == StageId::Completed
    }

    /// Mirrors `WorkflowState.get_completion_percentage()` in
    /// `original_source/server/schemas/base.py`: observability-only, not
    /// used to derive `current_stage` (see spec §3 invariants).
    pub fn completion_percentage(&self) -> f64 {
        let completed = StageId::WORKABLE
            .iter()
            .filter(|s| self.stage_status(**s) == StageStatus::Completed)
            .count();
        (completed as f64 / StageId::WORKABLE.len() as f64) * 100.0
    }

    /// Mark `stage` as `Running`, bumping `updated_at` (spec §4.6 step 6,
    /// the optional running-marker checkpoint referenced in spec §9's first
    /// open question).
    pub fn mark_running(&mut self, stage: StageId) {
        self.stage_flags.insert(stage, StageStatus::Running);
        self.touch();
    }

    /// Apply a successful stage completion: merge `output` into
    /// `stage_outputs`, mark the stage completed, and advance
    /// `current_stage` (spec §4.6 step 7).
    pub fn complete_stage(&mut self, stage: StageId, output: Value) {
        self.stage_outputs.insert(stage, output);
        self.stage_flags.insert(stage, StageStatus::Completed);
        match stage.next() {
            Some(StageId::Completed) | None => {
                self.current_stage = StageId::Completed;
                let now = Utc::now();
                self.completed_at = Some(now);
                self.total_processing_seconds =
                    Some((now - self.created_at).num_milliseconds() as f64 / 1000.0);
            }
            Some(next_stage) => {
                self.current_stage = next_stage;
                self.stage_flags.insert(next_stage, StageStatus::Pending);
            }
        }
        self.touch();
    }

    /// Apply a stage failure: mark `stage` failed without advancing
    /// `current_stage` (spec §4.6 step 8). The workflow remains resumable;
    /// use [`Self::mark_cancelled`] for the terminal variant.
    pub fn fail_stage(&mut self, stage: StageId) {
        self.stage_flags.insert(stage, StageStatus::Failed);
        self.touch();
    }

    /// Apply cancellation: mark the in-flight stage failed for observability
    /// and set the terminal `cancelled` marker exclusively reserved for the
    /// `Cancel` operation (spec §4.6, §5).
    pub fn mark_cancelled(&mut self, stage: StageId) {
        self.stage_flags.insert(stage, StageStatus::Failed);
        self.cancelled = true;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// An immutable durable snapshot of a [`WorkflowState`] (spec §3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub checkpoint_id: String,
    pub workflow_id: String,
    pub kind: CheckpointKind,
    pub timestamp: DateTime<Utc>,
    pub retain_until: Option<DateTime<Utc>>,
    pub state: WorkflowState,
    #[serde(default)]
    pub metadata: FxHashMap<String, Value>,
}

impl CheckpointRecord {
    pub fn new(kind: CheckpointKind, state: WorkflowState, retain_until: Option<DateTime<Utc>>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            checkpoint_id: Uuid::new_v4().to_string(),
            workflow_id: state.workflow_id.clone(),
            kind,
            timestamp: Utc::now(),
            retain_until,
            state,
            metadata: FxHashMap::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: FxHashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_workflow_starts_at_research_with_pending_flags() {
        let state = WorkflowState::new("graph databases", "trace-0001");
        assert_eq!(state.current_stage, StageId::Research);
        assert_eq!(state.stage_status(StageId::Research), StageStatus::Pending);
        assert!(!state.is_completed());
        assert_eq!(state.completion_percentage(), 0.0);
    }

    #[test]
    fn complete_stage_advances_current_stage() {
        let mut state = WorkflowState::new("kw", "trace-0001");
        state.complete_stage(StageId::Research, serde_json::json!({"ok": true}));
        assert_eq!(state.current_stage, StageId::Extraction);
        assert_eq!(state.stage_status(StageId::Research), StageStatus::Completed);
        assert_eq!(state.stage_status(StageId::Extraction), StageStatus::Pending);
    }

    #[test]
    fn completing_last_stage_marks_workflow_completed() {
        let mut state = WorkflowState::new("kw", "trace-0001");
        for stage in StageId::WORKABLE {
            state.complete_stage(stage, Value::Null);
        }
        assert!(state.is_completed());
        assert!(state.completed_at.is_some());
        assert_eq!(state.completion_percentage(), 100.0);
    }

    #[test]
    fn fail_stage_does_not_advance_or_terminate() {
        let mut state = WorkflowState::new("kw", "trace-0001");
        state.fail_stage(StageId::Research);
        assert_eq!(state.current_stage, StageId::Research);
        assert_eq!(state.stage_status(StageId::Research), StageStatus::Failed);
        assert!(!state.is_terminal());
    }

    #[test]
    fn mark_cancelled_is_terminal_and_unresumable() {
        let mut state = WorkflowState::new("kw", "trace-0001");
        state.mark_cancelled(StageId::Research);
        assert_eq!(state.stage_status(StageId::Research), StageStatus::Failed);
        assert!(state.is_terminal());
    }

    #[test]
    fn schema_roundtrip() {
        let state = WorkflowState::new("kw", "trace-0001");
        let json = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);

        let record = CheckpointRecord::new(CheckpointKind::Initial, state, None);
        let json = serde_json::to_string(&record).unwrap();
        let back: CheckpointRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
