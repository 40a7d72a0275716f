//! # wf-supervisor: a stateful workflow supervisor for a fixed agent DAG
//!
//! This crate implements the orchestration subsystem that drives a
//! research pipeline through a fixed seven-stage workflow:
//!
//! ```text
//! Research -> Extraction -> Retrieval -> WikiGeneration -> GraphVisualization -> FeedbackProcessing -> Completed
//! ```
//!
//! ## Core Concepts
//!
//! - **[`state::WorkflowState`]**: the single source of truth for a
//!   workflow's progress, mutated exclusively by the [`engine::Engine`].
//! - **[`kv`]**: a durable, TTL-aware key/value store underlying both the
//!   lock and checkpoint subsystems.
//! - **[`locks`]**: leased, per-resource exclusive locks enforcing
//!   at-most-one-in-flight-`Advance` per workflow.
//! - **[`checkpoint`]**: a write-only-forward journal of immutable
//!   `CheckpointRecord` snapshots.
//! - **[`retry`]**: bounded retry around agent invocations.
//! - **[`scheduler`]**: a cooperative driver for periodic snapshots and
//!   expired-checkpoint cleanup.
//! - **[`agent`]**: the uniform per-stage capability contract the Engine
//!   invokes.
//! - **[`engine`]**: the Supervisor itself, wiring the above into the
//!   stage-execution algorithm.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wf_supervisor::agent::{Agent, AgentInput, AgentOutput};
//! use wf_supervisor::config::Config;
//! use wf_supervisor::engine::Engine;
//! use wf_supervisor::errors::AgentError;
//! use wf_supervisor::kv::InMemoryKvStore;
//! use wf_supervisor::types::StageId;
//! use async_trait::async_trait;
//!
//! struct EchoAgent(StageId);
//!
//! #[async_trait]
//! impl Agent for EchoAgent {
//!     fn stage(&self) -> StageId {
//!         self.0
//!     }
//!
//!     async fn process(&self, _input: &AgentInput) -> Result<AgentOutput, AgentError> {
//!         Ok(serde_json::json!({ "ok": true }))
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(InMemoryKvStore::shared(), Config::default());
//! for stage in StageId::WORKABLE {
//!     engine.register_agent(Arc::new(EchoAgent(stage)));
//! }
//! let workflow_id = engine.start("graph databases", "trace-0001").await?;
//! let state = engine.run(&workflow_id).await?;
//! assert!(state.is_completed());
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod errors;
pub mod kv;
pub mod locks;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod telemetry;
pub mod types;
