use crate::scheduler::GraphPolicy;
use grove_agent::HandleConfig;
use grove_core::{GroveError, GroveResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What happens to the dependents of a failed task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamFailurePolicy {
    /// Mark every transitive dependent `Skipped` with reason
    /// "upstream failure".
    #[default]
    SkipDependents,
    /// Leave dependents `Pending` for manual or retried resolution. The run
    /// then ends in a scheduling-deadlock report once nothing else can
    /// proceed, which is the operator-intervention signal.
    LeavePending,
}

/// Configuration surface consumed by the orchestration engine.
///
/// Loadable from TOML; every field has a documented default so a partial
/// file is enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum tasks in flight at once; also the context pool capacity.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_instances: usize,
    /// How long one slot-acquire attempt may wait, in milliseconds.
    #[serde(default = "default_slot_acquire_timeout_ms")]
    pub slot_acquire_timeout_ms: u64,
    /// How many times an acquire timeout is retried before the task fails.
    #[serde(default = "default_slot_acquire_retries")]
    pub slot_acquire_retries: u32,
    /// Longest wait for any in-flight task to complete before the run is
    /// declared stalled, in milliseconds. Must exceed the worst-case attempt
    /// sequence (attempt timeout × attempts plus backoff).
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    /// Policy for dependents of a failed task.
    #[serde(default)]
    pub upstream_failure_policy: UpstreamFailurePolicy,
    /// Whether a `Skipped` dependency satisfies downstream eligibility.
    #[serde(default)]
    pub treat_skipped_as_resolved: bool,
    /// Retry, startup, and degradation behaviour of agent handles.
    #[serde(default)]
    pub agent: HandleConfig,
    /// Keep isolated checkouts on shutdown instead of removing them.
    #[serde(default)]
    pub keep_checkouts: bool,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_slot_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_slot_acquire_retries() -> u32 {
    3
}

fn default_stall_timeout_ms() -> u64 {
    3_600_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_instances: default_max_concurrent(),
            slot_acquire_timeout_ms: default_slot_acquire_timeout_ms(),
            slot_acquire_retries: default_slot_acquire_retries(),
            stall_timeout_ms: default_stall_timeout_ms(),
            upstream_failure_policy: UpstreamFailurePolicy::default(),
            treat_skipped_as_resolved: false,
            agent: HandleConfig::default(),
            keep_checkouts: false,
        }
    }
}

impl OrchestratorConfig {
    /// Parses a TOML configuration string.
    pub fn from_toml_str(raw: &str) -> GroveResult<Self> {
        toml::from_str(raw).map_err(|e| GroveError::Config(format!("invalid config: {e}")))
    }

    /// Loads configuration from a TOML file.
    pub fn from_toml_path(path: &Path) -> GroveResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GroveError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// The dependency-graph policy derived from this configuration.
    pub fn graph_policy(&self) -> GraphPolicy {
        GraphPolicy {
            on_upstream_failure: self.upstream_failure_policy,
            treat_skipped_as_resolved: self.treat_skipped_as_resolved,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_instances, 3);
        assert_eq!(config.slot_acquire_timeout_ms, 30_000);
        assert_eq!(config.stall_timeout_ms, 3_600_000);
        assert_eq!(
            config.upstream_failure_policy,
            UpstreamFailurePolicy::SkipDependents
        );
        assert!(!config.treat_skipped_as_resolved);
        assert_eq!(config.agent.retry.max_attempts, 3);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            max_concurrent_instances = 5
            upstream_failure_policy = "leave_pending"

            [agent.retry]
            max_attempts = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_instances, 5);
        assert_eq!(
            config.upstream_failure_policy,
            UpstreamFailurePolicy::LeavePending
        );
        assert_eq!(config.agent.retry.max_attempts, 2);
        // Untouched fields keep their defaults.
        assert_eq!(config.slot_acquire_retries, 3);
        assert_eq!(config.agent.startup_attempts, 3);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = OrchestratorConfig::from_toml_str("max_concurrent_instances = \"many\"")
            .unwrap_err();
        assert!(matches!(err, GroveError::Config(_)));
    }
}
