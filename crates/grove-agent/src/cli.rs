use crate::capability::{
    AgentError, ExecutionAgent, HealthStatus, InvocationResponse, TaskContext,
};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

/// Execution agent backed by the `claude` CLI in headless mode
/// (`-p --output-format json`).
///
/// The process runs with the bound checkout as its working directory, so the
/// agent can only touch files inside its isolated working copy. Uses the
/// operator's existing CLI session; no API key handling here.
pub struct CliAgent {
    binary: String,
    workdir: PathBuf,
    model: Option<String>,
    max_turns: u32,
}

impl CliAgent {
    /// Creates an agent operating inside `workdir`.
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            binary: "claude".to_string(),
            workdir,
            model: None,
            max_turns: 20,
        }
    }

    /// Overrides the model passed to the CLI.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Overrides the per-invocation turn budget.
    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    /// Overrides the binary name, for wrappers and tests.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Builds the full prompt: task description plus the accumulated
    /// context rendered as a bullet list.
    fn render_prompt(prompt: &str, context: &TaskContext) -> String {
        if context.is_empty() {
            return prompt.to_string();
        }
        let mut parts = vec![prompt.to_string(), "\nAdditional context:".to_string()];
        let mut keys: Vec<&String> = context.keys().collect();
        keys.sort();
        for key in keys {
            parts.push(format!("- {key}: {}", context[key]));
        }
        parts.join("\n")
    }

    fn classify_exit(code: Option<i32>, stderr: &str) -> AgentError {
        let lower = stderr.to_lowercase();
        if lower.contains("rate limit") || lower.contains("429") {
            return AgentError::rate_limited(stderr.trim().to_string());
        }
        if lower.contains("timeout") || lower.contains("timed out") {
            return AgentError::timeout(stderr.trim().to_string());
        }
        if lower.contains("connection") {
            return AgentError::connection_reset(stderr.trim().to_string());
        }
        if lower.contains("unauthorized") || lower.contains("not logged in") {
            return AgentError::authentication(stderr.trim().to_string());
        }
        AgentError::protocol(format!(
            "CLI failed (exit {}): {}",
            code.unwrap_or(-1),
            stderr.trim()
        ))
    }
}

#[async_trait]
impl ExecutionAgent for CliAgent {
    async fn start(&self) -> Result<(), AgentError> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| {
                AgentError::protocol(format!(
                    "failed to run '{}'. Is the CLI installed? {e}",
                    self.binary
                ))
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AgentError::protocol(format!(
                "'{} --version' exited with {}",
                self.binary,
                output.status.code().unwrap_or(-1)
            )))
        }
    }

    async fn invoke(
        &self,
        prompt: &str,
        context: &TaskContext,
    ) -> Result<InvocationResponse, AgentError> {
        let full_prompt = Self::render_prompt(prompt, context);

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("-p").arg(&full_prompt);
        cmd.arg("--output-format").arg("json");
        cmd.arg("--max-turns").arg(self.max_turns.to_string());
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.current_dir(&self.workdir);

        info!(
            workdir = %self.workdir.display(),
            prompt_len = full_prompt.len(),
            "spawning agent CLI"
        );

        let output = cmd.output().await.map_err(|e| {
            AgentError::protocol(format!("failed to run '{}': {e}", self.binary))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(Self::classify_exit(output.status.code(), &stderr));
        }

        let result_json: serde_json::Value = stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str(line).ok())
            .ok_or_else(|| {
                AgentError::protocol(format!(
                    "could not parse CLI output as JSON. stdout: {}",
                    &stdout[..stdout.len().min(500)]
                ))
            })?;

        let is_error = result_json["is_error"].as_bool().unwrap_or(false);
        let result_text = result_json["result"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        if is_error {
            return Err(AgentError::invalid_request(format!(
                "agent reported error: {result_text}"
            )));
        }

        if let Some(turns) = result_json["num_turns"].as_u64() {
            info!(num_turns = turns, "agent CLI response received");
        }

        Ok(InvocationResponse {
            output: result_text,
        })
    }

    async fn probe(&self) -> HealthStatus {
        match self.start().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::capability::AgentErrorKind;

    #[test]
    fn test_render_prompt_appends_sorted_context() {
        let mut context = TaskContext::new();
        context.insert("branch".into(), serde_json::json!("grove/a"));
        context.insert("attempt".into(), serde_json::json!(2));

        let rendered = CliAgent::render_prompt("fix the tests", &context);
        assert!(rendered.starts_with("fix the tests"));
        let attempt_pos = rendered.find("- attempt").unwrap();
        let branch_pos = rendered.find("- branch").unwrap();
        assert!(attempt_pos < branch_pos);
    }

    #[test]
    fn test_render_prompt_without_context_is_plain() {
        assert_eq!(
            CliAgent::render_prompt("just do it", &TaskContext::new()),
            "just do it"
        );
    }

    #[test]
    fn test_classify_exit_kinds() {
        assert_eq!(
            CliAgent::classify_exit(Some(1), "429 rate limit exceeded").kind,
            AgentErrorKind::RateLimited
        );
        assert_eq!(
            CliAgent::classify_exit(Some(1), "request timed out").kind,
            AgentErrorKind::Timeout
        );
        assert_eq!(
            CliAgent::classify_exit(Some(1), "connection reset by peer").kind,
            AgentErrorKind::ConnectionReset
        );
        assert_eq!(
            CliAgent::classify_exit(Some(1), "not logged in").kind,
            AgentErrorKind::Authentication
        );
        assert_eq!(
            CliAgent::classify_exit(Some(2), "segfault").kind,
            AgentErrorKind::Protocol
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_fatal() {
        let agent = CliAgent::new(PathBuf::from("."))
            .with_binary("definitely-not-a-real-binary-grove");
        let err = agent.invoke("hi", &TaskContext::new()).await.unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::Protocol);
        assert!(!err.is_transient());
    }
}
