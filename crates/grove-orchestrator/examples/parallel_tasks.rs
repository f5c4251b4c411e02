//! Runs three independent tasks under a concurrency bound of two, using the
//! in-memory isolation provider and a trivial in-process agent, so the demo
//! needs no git repository and no CLI.
//!
//! ```sh
//! cargo run -p grove-orchestrator --example parallel_tasks
//! ```

use async_trait::async_trait;
use grove_agent::{AgentError, ExecutionAgent, HealthStatus, InvocationResponse, TaskContext};
use grove_core::GroveResult;
use grove_orchestrator::{AgentFactory, Orchestrator, OrchestratorConfig, TaskSpec};
use grove_store::{FileSessionStore, SessionStore};
use grove_worktree::{InMemoryIsolation, IsolatedCheckout};
use std::sync::Arc;

struct EchoAgent;

#[async_trait]
impl ExecutionAgent for EchoAgent {
    async fn start(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn invoke(
        &self,
        prompt: &str,
        _context: &TaskContext,
    ) -> Result<InvocationResponse, AgentError> {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        Ok(InvocationResponse {
            output: format!("echo: {prompt}"),
        })
    }

    async fn probe(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

#[tokio::main]
async fn main() -> GroveResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let dir = tempfile::tempdir()?;
    let store = Arc::new(FileSessionStore::new(dir.path().join("store")).await?);
    let isolation = Arc::new(InMemoryIsolation::new(dir.path().join("checkouts")));
    let factory: Arc<dyn AgentFactory> = Arc::new(|_checkout: &IsolatedCheckout| {
        Arc::new(EchoAgent) as Arc<dyn ExecutionAgent>
    });

    let config = OrchestratorConfig {
        max_concurrent_instances: 2,
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(
        config,
        Arc::clone(&store) as Arc<dyn SessionStore>,
        isolation,
        factory,
    );

    let report = orchestrator
        .run_parallel_tasks(
            "demo",
            vec![
                TaskSpec::new("inventory the repository"),
                TaskSpec::new("draft release notes"),
                TaskSpec::new("summarize open work"),
            ],
        )
        .await?;

    println!("{}", report.summary);
    for task in &report.tasks {
        println!(
            "  {:<28} {:?} -> {}",
            task.description,
            task.state,
            task.result().unwrap_or("-")
        );
    }

    orchestrator.shutdown(false).await?;
    Ok(())
}
