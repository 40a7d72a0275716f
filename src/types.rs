//! Core identifiers shared across the supervisor orchestration subsystem.
//!
//! # Key Types
//!
//! - [`StageId`]: the canonical, compile-time-visible DAG stage enumeration.
//!   Replaces the source system's dispatch-by-string (`"research"`,
//!   `"extract"`, ...) per the redesign note in spec §9.
//! - [`CheckpointKind`]: the kind discriminant of a [`crate::state::CheckpointRecord`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// One node of the fixed workflow DAG (spec §4.6):
///
/// ```text
/// Research -> Extraction -> Retrieval -> WikiGeneration -> GraphVisualization -> FeedbackProcessing -> Completed
/// ```
///
/// `StageId` is ordered; [`StageId::ordinal`] gives the canonical position
/// used by invariants P1/P2 (monotonic progression, no skipped stages).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Research,
    Extraction,
    Retrieval,
    WikiGeneration,
    GraphVisualization,
    FeedbackProcessing,
    Completed,
}

impl StageId {
    /// All stages in canonical DAG order, `Completed` last.
    pub const ORDERED: [StageId; 7] = [
        StageId::Research,
        StageId::Extraction,
        StageId::Retrieval,
        StageId::WikiGeneration,
        StageId::GraphVisualization,
        StageId::FeedbackProcessing,
        StageId::Completed,
    ];

    /// All stages that require an agent invocation, i.e. every stage except
    /// the terminal `Completed` pseudo-stage.
    pub const WORKABLE: [StageId; 6] = [
        StageId::Research,
        StageId::Extraction,
        StageId::Retrieval,
        StageId::WikiGeneration,
        StageId::GraphVisualization,
        StageId::FeedbackProcessing,
    ];

    /// Position in the canonical order; used to check P1/P2.
    pub fn ordinal(self) -> usize {
        Self::ORDERED.iter().position(|s| *s == self).expect("StageId::ORDERED is exhaustive")
    }

    /// The stage immediately following this one in the DAG, or `None` if
    /// this is the terminal `Completed` stage.
    pub fn next(self) -> Option<StageId> {
        Self::ORDERED.get(self.ordinal() + 1).copied()
    }

    /// Whether this is the terminal stage of the DAG.
    pub fn is_terminal(self) -> bool {
        matches!(self, StageId::Completed)
    }

    /// Stable wire/storage encoding, independent of serde's derive so the
    /// checkpoint key scheme (spec §4.3) and log lines stay human-readable
    /// across schema evolution.
    pub fn encode(self) -> &'static str {
        match self {
            StageId::Research => "research",
            StageId::Extraction => "extraction",
            StageId::Retrieval => "retrieval",
            StageId::WikiGeneration => "wiki_generation",
            StageId::GraphVisualization => "graph_visualization",
            StageId::FeedbackProcessing => "feedback_processing",
            StageId::Completed => "completed",
        }
    }

    /// Inverse of [`StageId::encode`]. Unknown strings have no forward-compatible
    /// fallback here (unlike `NodeKind::decode`'s `Custom` catch-all) because
    /// the DAG is fixed and finite; callers should treat decode failure as a
    /// schema error.
    pub fn decode(s: &str) -> Option<StageId> {
        Some(match s {
            "research" => StageId::Research,
            "extraction" => StageId::Extraction,
            "retrieval" => StageId::Retrieval,
            "wiki_generation" => StageId::WikiGeneration,
            "graph_visualization" => StageId::GraphVisualization,
            "feedback_processing" => StageId::FeedbackProcessing,
            "completed" => StageId::Completed,
            _ => return None,
        })
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Discriminant for a [`crate::state::CheckpointRecord`] (spec §3, §4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Periodic,
    StageCompletion,
    Manual,
    ErrorRecovery,
    Initial,
    Final,
}

impl CheckpointKind {
    pub fn encode(self) -> &'static str {
        match self {
            CheckpointKind::Periodic => "periodic",
            CheckpointKind::StageCompletion => "stage_completion",
            CheckpointKind::Manual => "manual",
            CheckpointKind::ErrorRecovery => "error_recovery",
            CheckpointKind::Initial => "initial",
            CheckpointKind::Final => "final",
        }
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_is_monotonic_along_ordered() {
        for (i, stage) in StageId::ORDERED.iter().enumerate() {
            assert_eq!(stage.ordinal(), i);
        }
    }

    #[test]
    fn next_chains_to_completed() {
        let mut stage = StageId::Research;
        let mut hops = 0;
        while let Some(n) = stage.next() {
            stage = n;
            hops += 1;
            assert!(hops <= StageId::ORDERED.len());
        }
        assert_eq!(stage, StageId::Completed);
    }

    #[test]
    fn encode_decode_roundtrip() {
        for stage in StageId::ORDERED {
            assert_eq!(StageId::decode(stage.encode()), Some(stage));
        }
    }
}
