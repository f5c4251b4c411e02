//! Execution-agent capability and the stateful agent handle.
//!
//! An execution agent is an opaque request/response capability: it accepts a
//! prompt plus context and returns a structured result or a classified
//! error. The [`AgentHandle`] wraps one agent bound to one context slot and
//! layers on the behavior the orchestrator relies on: bounded retry with
//! exponential backoff and jitter for transient failures, degradation after
//! consecutive exhaustions, and health probing.
//!
//! # Main types
//!
//! - [`ExecutionAgent`] — Capability trait (start / invoke / probe).
//! - [`AgentError`] / [`AgentErrorKind`] — Closed transient/fatal taxonomy.
//! - [`RetryPolicy`] — Backoff curve configuration.
//! - [`AgentHandle`] — Lifecycle state machine and retry driver.
//! - [`CliAgent`] — Agent backed by the `claude` CLI in headless mode.

/// The capability trait and its error taxonomy.
pub mod capability;
/// `claude` CLI-backed execution agent.
pub mod cli;
/// The stateful handle driving retry, degradation, and health.
pub mod handle;
/// Backoff curve configuration and computation.
pub mod retry;

pub use capability::{
    AgentError, AgentErrorKind, ExecutionAgent, HealthStatus, InvocationResponse, TaskContext,
};
pub use cli::CliAgent;
pub use handle::{AgentHandle, HandleConfig, HandleState, RunReport};
pub use retry::RetryPolicy;
