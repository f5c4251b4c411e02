use async_trait::async_trait;
use grove_core::GroveError;
use serde::{Deserialize, Serialize};

pub use grove_core::TaskContext;

/// Classified failure kind for an agent invocation.
///
/// The retry policy keys off this closed set: transient kinds are retried
/// with backoff, fatal kinds fail the task immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    /// The invocation exceeded its per-attempt deadline.
    Timeout,
    /// The transport to the agent dropped mid-request.
    ConnectionReset,
    /// The agent refused the request due to rate limiting.
    RateLimited,
    /// The request itself was malformed; retrying cannot help.
    InvalidRequest,
    /// The caller is not authorized against the agent.
    Authentication,
    /// The agent violated its own protocol (unparseable or error result).
    Protocol,
}

impl AgentErrorKind {
    /// Whether failures of this kind are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentErrorKind::Timeout | AgentErrorKind::ConnectionReset | AgentErrorKind::RateLimited
        )
    }
}

impl std::fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentErrorKind::Timeout => "timeout",
            AgentErrorKind::ConnectionReset => "connection reset",
            AgentErrorKind::RateLimited => "rate limited",
            AgentErrorKind::InvalidRequest => "invalid request",
            AgentErrorKind::Authentication => "authentication",
            AgentErrorKind::Protocol => "protocol",
        };
        write!(f, "{name}")
    }
}

/// An error returned by an execution agent.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AgentError {
    /// Classified failure kind.
    pub kind: AgentErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl AgentError {
    /// Builds an error of the given kind.
    pub fn new(kind: AgentErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A per-attempt deadline expiry.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Timeout, message)
    }

    /// A dropped transport.
    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::ConnectionReset, message)
    }

    /// A rate-limit refusal.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::RateLimited, message)
    }

    /// A malformed request.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::InvalidRequest, message)
    }

    /// An authorization failure.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Authentication, message)
    }

    /// A protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Protocol, message)
    }

    /// Whether this failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl From<AgentError> for GroveError {
    fn from(err: AgentError) -> Self {
        GroveError::Agent(err.to_string())
    }
}

/// Successful response from an agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResponse {
    /// Output text produced by the agent.
    pub output: String,
}

/// Result of a lightweight health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// The agent answered the probe.
    Healthy,
    /// The agent did not answer, or answered abnormally.
    Unhealthy,
}

/// External execution-agent capability.
///
/// The agent's internal reasoning is not modeled; the engine only sees this
/// request/response surface.
#[async_trait]
pub trait ExecutionAgent: Send + Sync {
    /// Startup probe; called by the handle until it succeeds or the startup
    /// attempt budget is exhausted.
    async fn start(&self) -> Result<(), AgentError>;
    /// Executes one prompt with accumulated context.
    async fn invoke(
        &self,
        prompt: &str,
        context: &TaskContext,
    ) -> Result<InvocationResponse, AgentError>;
    /// Lightweight liveness probe; never consumes a retry budget.
    async fn probe(&self) -> HealthStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AgentError::timeout("slow").is_transient());
        assert!(AgentError::connection_reset("eof").is_transient());
        assert!(AgentError::rate_limited("429").is_transient());
        assert!(!AgentError::invalid_request("bad prompt").is_transient());
        assert!(!AgentError::authentication("no key").is_transient());
        assert!(!AgentError::protocol("garbage output").is_transient());
    }

    #[test]
    fn test_error_display_includes_kind() {
        let err = AgentError::rate_limited("try later");
        assert_eq!(err.to_string(), "rate limited: try later");
    }
}
