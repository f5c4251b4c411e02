//! Core types and error definitions for the Grove orchestration engine.
//!
//! This crate provides the foundational types shared across all Grove crates:
//! the unified error taxonomy and the closed task-outcome variant that every
//! consumer must handle exhaustively.
//!
//! # Main types
//!
//! - [`GroveError`] — Unified error enum for all Grove subsystems.
//! - [`GroveResult`] — Convenience alias for `Result<T, GroveError>`.
//! - [`TaskOutcome`] — Terminal result of a task execution.
//! - [`TaskContext`] — Key-value context handed to the agent with a prompt.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Key-value context accumulated for a task and handed to the executing
/// agent alongside the prompt.
pub type TaskContext = HashMap<String, serde_json::Value>;

// --- Error types ---

/// Top-level error type for the Grove engine.
///
/// Graph errors (`Cycle`, `UnknownDependency`) are rejected at mutation time
/// and never partially applied. Resource errors (`AcquireTimeout`,
/// `DoubleRelease`, `IsolationCreate`) are surfaced to the orchestrator loop,
/// which retries or fails the affected task without aborting the session.
/// `SchedulingDeadlock` and `Store` errors are fatal to a session run.
#[derive(Debug, thiserror::Error)]
pub enum GroveError {
    /// Adding the requested dependency edges would create a cycle.
    #[error("dependency cycle: {0}")]
    Cycle(String),

    /// A dependency id does not belong to the session's task set.
    #[error("unknown dependency {0} in session {1}")]
    UnknownDependency(Uuid, Uuid),

    /// No context slot became free within the caller-supplied timeout.
    #[error("slot acquire timed out after {0} ms")]
    AcquireTimeout(u64),

    /// `release` was called on a slot that is not currently held.
    #[error("double release of slot {0}")]
    DoubleRelease(Uuid),

    /// The isolation capability failed to create a checkout.
    #[error("isolation create failed: {0}")]
    IsolationCreate(String),

    /// An error from the isolation capability outside of checkout creation.
    #[error("isolation error: {0}")]
    Isolation(String),

    /// An execution agent could not be started within the configured attempts.
    #[error("agent unavailable: {0}")]
    AgentUnavailable(String),

    /// An error from an execution agent invocation.
    #[error("agent error: {0}")]
    Agent(String),

    /// Non-terminal tasks remain but none are eligible and none are in flight.
    #[error("scheduling deadlock: {0}")]
    SchedulingDeadlock(String),

    /// A durable store operation failed; task state can no longer be trusted.
    #[error("store error: {0}")]
    Store(String),

    /// A session lookup or state transition was invalid.
    #[error("session error: {0}")]
    Session(String),

    /// An error in configuration parsing or validation.
    #[error("config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`GroveError`].
pub type GroveResult<T> = Result<T, GroveError>;

// --- Outcome types ---

/// Terminal result of a task execution.
///
/// A closed variant: consumers must match all three cases, so a new terminal
/// state cannot slip past a call site unnoticed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The task finished and produced a result payload.
    Succeeded {
        /// Output produced by the executing agent.
        result: String,
    },
    /// The task failed after exhausting its retry budget, or fatally.
    Failed {
        /// Why the task failed.
        reason: String,
    },
    /// The task was never run because an upstream dependency failed.
    Skipped {
        /// Why the task was skipped.
        reason: String,
    },
}

impl TaskOutcome {
    /// Whether this outcome is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded { .. })
    }

    /// The failure or skip reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            TaskOutcome::Succeeded { .. } => None,
            TaskOutcome::Failed { reason } | TaskOutcome::Skipped { reason } => Some(reason),
        }
    }
}
