//! The uniform capability contract consumed by the [`crate::engine::Engine`]
//! for each of the seven DAG stages (spec §6.1).
//!
//! Grounded in `node.rs`'s `Node` trait: an `async_trait` boundary taking
//! the full shared state and returning a partial update, with a distinct
//! fatal-vs-recoverable error split. Entity/Relation shapes come directly
//! from spec §6.1's stage payload contracts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::AgentError;
use crate::state::WorkflowState;
use crate::types::StageId;

/// A node or fact extracted by the Extraction stage (spec §6.1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub name: String,
    pub confidence: f64,
}

/// `Entity.type` is an open set in the source schema ("PERSON,
/// ORGANIZATION, ..."); modeled as a newtype over `String` with constants
/// for the named members rather than a fixed enum, so unrecognized agent
/// output still deserializes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(pub String);

impl EntityType {
    pub const PERSON: &'static str = "PERSON";
    pub const ORGANIZATION: &'static str = "ORGANIZATION";
    pub const LOCATION: &'static str = "LOCATION";
    pub const CONCEPT: &'static str = "CONCEPT";
    pub const EVENT: &'static str = "EVENT";

    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A directed, typed edge between two [`Entity`] ids (spec §6.1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub source: String,
    pub target: String,
    pub predicate: String,
    pub confidence: f64,
}

/// The view of [`WorkflowState`] an agent is handed: the whole state, since
/// "the agent reads only the fields it declares" (spec §6.1) is a
/// convention enforced by the agent's own implementation, not the type
/// system.
pub type AgentInput = WorkflowState;

/// An agent's successful result: a JSON document merged into
/// `stage_outputs[stage]` by the Engine (spec §4.6 step 7).
pub type AgentOutput = Value;

/// Liveness/readiness reported by [`Agent::health_check`] (SPEC_FULL §2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Healthy,
    Degraded,
    Unavailable,
}

/// The per-stage capability contract (spec §6.1).
#[async_trait]
pub trait Agent: Send + Sync {
    /// The DAG stage this agent fulfills.
    fn stage(&self) -> StageId;

    /// Produce this stage's output from the current workflow state.
    /// Implementations should raise [`AgentError::InvalidInput`] when a
    /// required upstream field is absent, and
    /// [`AgentError::Transient`]/[`AgentError::Timeout`] for conditions the
    /// Retry Policy (spec §4.4) should retry.
    async fn process(&self, input: &AgentInput) -> Result<AgentOutput, AgentError>;

    /// Cheap liveness probe; the Engine does not block stage execution on
    /// this, but it is surfaced through `GET health` (SPEC_FULL §2).
    async fn health_check(&self) -> AgentStatus {
        AgentStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_roundtrips_known_labels() {
        for label in [
            EntityType::PERSON,
            EntityType::ORGANIZATION,
            EntityType::LOCATION,
            EntityType::CONCEPT,
            EntityType::EVENT,
        ] {
            let json = serde_json::to_string(&EntityType::new(label)).unwrap();
            assert_eq!(json, format!("\"{label}\""));
        }
    }

    #[test]
    fn entity_type_accepts_an_open_set() {
        let decoded: EntityType = serde_json::from_str("\"ARTIFACT\"").unwrap();
        assert_eq!(decoded, EntityType::new("ARTIFACT"));
    }
}
