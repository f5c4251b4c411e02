//! Orchestration and scheduling engine for worktree-isolated agents.
//!
//! A session owns a directed acyclic graph of tasks. The engine releases a
//! task for execution only once every dependency has resolved favorably,
//! dispatches it to an agent handle bound to an isolated checkout, bounds
//! concurrency with a fixed context-slot pool, and reconciles every outcome
//! into the durable store so a crashed session can resume.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Top-level control loop binding all components.
//! - [`DependencyScheduler`] / [`TaskGraph`] — Dependency tracking and
//!   eligibility.
//! - [`ContextPool`] — Bounded, FIFO-fair slot allocation.
//! - [`OrchestratorConfig`] — The configuration surface consumed by the
//!   engine.

/// Engine configuration surface.
pub mod config;
/// The orchestrator control loop.
pub mod engine;
/// Context slot pool with bounded, fair acquisition.
pub mod pool;
/// Dependency graph tracking and task eligibility.
pub mod scheduler;

pub use config::{OrchestratorConfig, UpstreamFailurePolicy};
pub use engine::{
    AgentFactory, CliAgentFactory, HealthReport, Orchestrator, RunStatus, SessionReport, TaskSpec,
};
pub use pool::ContextPool;
pub use scheduler::{DependencyScheduler, GraphPolicy, TaskGraph};
