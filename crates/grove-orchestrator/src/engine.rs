use crate::config::OrchestratorConfig;
use crate::pool::ContextPool;
use crate::scheduler::DependencyScheduler;
use grove_agent::{
    AgentHandle, CliAgent, ExecutionAgent, HandleState, HealthStatus, TaskContext,
};
use grove_core::{GroveError, GroveResult, TaskOutcome};
use grove_store::{SessionRecord, SessionStatus, SessionStore, TaskRecord, TaskState};
use grove_worktree::{
    generated_branch_name, generated_checkout_name, IsolatedCheckout, IsolationProvider,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Builds execution agents for freshly bound checkouts.
pub trait AgentFactory: Send + Sync {
    /// Builds an agent operating inside the given checkout.
    fn create(&self, checkout: &IsolatedCheckout) -> Arc<dyn ExecutionAgent>;
}

impl<F> AgentFactory for F
where
    F: Fn(&IsolatedCheckout) -> Arc<dyn ExecutionAgent> + Send + Sync,
{
    fn create(&self, checkout: &IsolatedCheckout) -> Arc<dyn ExecutionAgent> {
        self(checkout)
    }
}

/// Factory producing [`CliAgent`]s rooted in each checkout's working copy.
#[derive(Debug, Clone, Default)]
pub struct CliAgentFactory {
    /// Model override passed to the CLI, if any.
    pub model: Option<String>,
    /// Per-invocation turn budget.
    pub max_turns: Option<u32>,
}

impl AgentFactory for CliAgentFactory {
    fn create(&self, checkout: &IsolatedCheckout) -> Arc<dyn ExecutionAgent> {
        let mut agent = CliAgent::new(checkout.path.clone());
        if let Some(model) = &self.model {
            agent = agent.with_model(model.clone());
        }
        if let Some(max_turns) = self.max_turns {
            agent = agent.with_max_turns(max_turns);
        }
        Arc::new(agent)
    }
}

/// Specification for one task added to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// What the executing agent is asked to do.
    pub description: String,
    /// Ids of tasks that must resolve first.
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    /// Extra context handed to the agent.
    #[serde(default)]
    pub context: TaskContext,
}

impl TaskSpec {
    /// Creates a dependency-free spec.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            dependencies: Vec::new(),
            context: TaskContext::new(),
        }
    }

    /// Adds dependencies on earlier tasks.
    pub fn with_dependencies(mut self, dependencies: Vec<Uuid>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Attaches agent context.
    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }
}

/// Overall status of a session run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every task reached a terminal state. Partial success (some tasks
    /// failed or skipped) still completes the run.
    Completed,
    /// Cancellation stopped dispatch before every task turned terminal; the
    /// session stays active and can be resumed.
    Cancelled,
}

/// Result of a full session run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    /// The session that ran.
    pub session_id: Uuid,
    /// Overall run status.
    pub status: RunStatus,
    /// One-line human summary.
    pub summary: String,
    /// Count of succeeded tasks.
    pub succeeded: usize,
    /// Count of failed tasks.
    pub failed: usize,
    /// Count of skipped tasks.
    pub skipped: usize,
    /// Final snapshot of every task, in insertion order.
    pub tasks: Vec<TaskRecord>,
}

/// Aggregate component health, for operators.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Conjunction of every component check.
    pub healthy: bool,
    /// Whether the durable store answered.
    pub store_healthy: bool,
    /// Whether the isolation capability answered.
    pub isolation_healthy: bool,
    /// Probe result per live agent handle.
    pub agents: Vec<(Uuid, bool)>,
}

struct TaskCompletion {
    task_id: Uuid,
    slot: Uuid,
    outcome: TaskOutcome,
    retries: u32,
}

/// Top-level coordinator: binds the dependency scheduler, context pool,
/// agent handles, and durable store into one control loop per session.
///
/// Agent handles live in an in-memory arena keyed by slot id and owned
/// exclusively by this instance; nothing here is a process-wide singleton.
pub struct Orchestrator {
    config: OrchestratorConfig,
    scheduler: Arc<DependencyScheduler>,
    pool: Arc<ContextPool>,
    store: Arc<dyn SessionStore>,
    isolation: Arc<dyn IsolationProvider>,
    agents: Arc<dyn AgentFactory>,
    handles: RwLock<HashMap<Uuid, Arc<AgentHandle>>>,
    /// Stops new dispatches; in-flight tasks drain.
    cancel: CancellationToken,
    /// Propagated into in-flight invocations on forced shutdown.
    hard_cancel: CancellationToken,
}

impl Orchestrator {
    /// Creates an orchestrator over the given collaborators. Pool capacity
    /// equals the configured concurrency bound.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn SessionStore>,
        isolation: Arc<dyn IsolationProvider>,
        agents: Arc<dyn AgentFactory>,
    ) -> Self {
        let scheduler = Arc::new(DependencyScheduler::new(config.graph_policy()));
        let pool = Arc::new(ContextPool::new(config.max_concurrent_instances));
        Self {
            config,
            scheduler,
            pool,
            store,
            isolation,
            agents,
            handles: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            hard_cancel: CancellationToken::new(),
        }
    }

    /// The dependency scheduler, for direct graph inspection.
    pub fn scheduler(&self) -> &Arc<DependencyScheduler> {
        &self.scheduler
    }

    /// The context pool, for capacity inspection.
    pub fn pool(&self) -> &Arc<ContextPool> {
        &self.pool
    }

    /// Creates and persists a new active session.
    pub async fn create_session(
        &self,
        label: impl Into<String>,
        description: Option<String>,
    ) -> GroveResult<SessionRecord> {
        let session = SessionRecord::new(label, description);
        self.store.create_session(&session).await?;
        self.scheduler.open_session(session.id).await?;
        info!(session = %session.id, label = %session.label, "session created");
        Ok(session)
    }

    /// Adds a task to a session and persists it.
    pub async fn add_task(
        &self,
        session_id: Uuid,
        description: impl Into<String>,
        dependencies: Vec<Uuid>,
    ) -> GroveResult<TaskRecord> {
        self.add_task_spec(
            session_id,
            TaskSpec::new(description).with_dependencies(dependencies),
        )
        .await
    }

    /// Adds a task from a full spec and persists it.
    pub async fn add_task_spec(
        &self,
        session_id: Uuid,
        spec: TaskSpec,
    ) -> GroveResult<TaskRecord> {
        let record = TaskRecord::new(session_id, spec.description, spec.dependencies)
            .with_context(spec.context);
        let id = record.id;
        self.scheduler.add_batch(session_id, vec![record]).await?;
        let task = self
            .scheduler
            .tasks(session_id)
            .await?
            .into_iter()
            .find(|t| t.id == id)
            .ok_or_else(|| GroveError::Session(format!("task {id} vanished after insert")))?;
        self.store.create_task(&task).await?;
        Ok(task)
    }

    /// Reloads a previously persisted session so it can run again after a
    /// crash or restart. Tasks that were claimed or running when the
    /// process died are re-queued.
    pub async fn resume_session(&self, session_id: Uuid) -> GroveResult<SessionRecord> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| GroveError::Session(format!("session {session_id} not found")))?;
        if session.status != SessionStatus::Active {
            return Err(GroveError::Session(format!(
                "session {session_id} is {:?}, only active sessions resume",
                session.status
            )));
        }
        let tasks = self.store.list_tasks_by_session(session_id).await?;
        self.scheduler.hydrate_session(session_id, tasks).await?;
        info!(session = %session_id, "session resumed");
        Ok(session)
    }

    /// Archives a session. Sessions are only ever destroyed by this
    /// explicit call, never implicitly.
    pub async fn archive_session(&self, session_id: Uuid) -> GroveResult<()> {
        self.store
            .update_session_status(session_id, SessionStatus::Archived)
            .await
    }

    /// Runs a session to completion: dispatches eligible tasks to agents
    /// under the concurrency bound, reconciles every outcome into the
    /// scheduler and the store, and reports per-task results.
    ///
    /// Task failures are normal terminal states and never fail the run;
    /// only a scheduling deadlock or a persistence failure does, in which
    /// case the session is marked failed and the error propagates.
    pub async fn run_session(&self, session_id: Uuid) -> GroveResult<SessionReport> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| GroveError::Session(format!("session {session_id} not found")))?;
        if session.status != SessionStatus::Active {
            return Err(GroveError::Session(format!(
                "session {session_id} is {:?}, not active",
                session.status
            )));
        }

        info!(session = %session_id, "session run starting");
        match self.drive(session_id).await {
            Ok(report) => {
                if report.status == RunStatus::Completed {
                    self.store
                        .update_session_status(session_id, SessionStatus::Completed)
                        .await?;
                }
                info!(session = %session_id, summary = %report.summary, "session run finished");
                Ok(report)
            }
            Err(e) => {
                error!(session = %session_id, error = %e, "session run failed");
                if let Err(persist_err) = self
                    .store
                    .update_session_status(session_id, SessionStatus::Failed)
                    .await
                {
                    warn!(error = %persist_err, "failed to mark session failed");
                }
                Err(e)
            }
        }
    }

    /// Convenience: create a session, add independent tasks, run it.
    pub async fn run_parallel_tasks(
        &self,
        label: impl Into<String>,
        specs: Vec<TaskSpec>,
    ) -> GroveResult<SessionReport> {
        let session = self
            .create_session(
                label,
                Some(format!("parallel execution of {} tasks", specs.len())),
            )
            .await?;
        for spec in specs {
            self.add_task_spec(session.id, spec).await?;
        }
        self.run_session(session.id).await
    }

    /// Convenience: create a session whose tasks form a chain, each step
    /// depending on the one before it, and run it.
    pub async fn run_sequential_workflow(
        &self,
        label: impl Into<String>,
        specs: Vec<TaskSpec>,
    ) -> GroveResult<SessionReport> {
        let session = self
            .create_session(
                label,
                Some(format!("sequential workflow with {} steps", specs.len())),
            )
            .await?;
        let mut previous: Option<Uuid> = None;
        for mut spec in specs {
            if let Some(prev) = previous {
                spec.dependencies.push(prev);
            }
            let task = self.add_task_spec(session.id, spec).await?;
            previous = Some(task.id);
        }
        self.run_session(session.id).await
    }

    /// Stops acceptance of new dispatches; in-flight tasks finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Shuts the orchestrator down: no new dispatches, handles terminated,
    /// checkouts removed unless configured to keep them. With `force`, the
    /// cancellation signal also propagates into in-flight invocations.
    pub async fn shutdown(&self, force: bool) -> GroveResult<()> {
        self.cancel.cancel();
        if force {
            self.hard_cancel.cancel();
        }
        for (_, handle) in self.handles.write().drain() {
            handle.terminate();
        }
        if !self.config.keep_checkouts {
            for (_, checkout) in self.pool.bindings() {
                if let Err(e) = self.isolation.remove_isolated(&checkout.name).await {
                    warn!(checkout = %checkout.name, error = %e, "checkout removal failed");
                }
            }
        }
        info!("orchestrator shut down");
        Ok(())
    }

    /// Probes every component: store, isolation capability, and each live
    /// agent handle.
    pub async fn health_check(&self) -> HealthReport {
        let store_healthy = self.store.get_session(Uuid::nil()).await.is_ok();
        let isolation_healthy = self.isolation.list_isolated().await.is_ok();
        let handles: Vec<Arc<AgentHandle>> = self.handles.read().values().cloned().collect();
        let mut agents = Vec::with_capacity(handles.len());
        for handle in handles {
            let healthy = handle.health_check().await == HealthStatus::Healthy;
            agents.push((handle.id(), healthy));
        }
        let healthy = store_healthy && isolation_healthy && agents.iter().all(|(_, ok)| *ok);
        HealthReport {
            healthy,
            store_healthy,
            isolation_healthy,
            agents,
        }
    }

    async fn drive(&self, session_id: Uuid) -> GroveResult<SessionReport> {
        let mut in_flight: JoinSet<TaskCompletion> = JoinSet::new();
        let stall = Duration::from_millis(self.config.stall_timeout_ms);

        loop {
            if !self.cancel.is_cancelled() {
                while in_flight.len() < self.config.max_concurrent_instances {
                    let Some(task) = self.scheduler.next_eligible(session_id).await? else {
                        break;
                    };
                    self.dispatch(session_id, task, &mut in_flight).await?;
                }
            }

            if in_flight.is_empty() {
                if self.scheduler.is_session_complete(session_id).await? {
                    return self.report(session_id, RunStatus::Completed).await;
                }
                if self.cancel.is_cancelled() {
                    return self.report(session_id, RunStatus::Cancelled).await;
                }
                // Nothing eligible, nothing in flight, non-terminal tasks
                // remain: the graph can make no further progress.
                let blocked = self.scheduler.non_terminal_count(session_id).await?;
                return Err(GroveError::SchedulingDeadlock(format!(
                    "session {session_id}: {blocked} non-terminal tasks with no eligible successor and none in flight"
                )));
            }

            match tokio::time::timeout(stall, in_flight.join_next()).await {
                Ok(Some(Ok(completion))) => self.reconcile(session_id, completion).await?,
                Ok(Some(Err(e))) => error!(error = %e, "in-flight task join failed"),
                Ok(None) => {}
                // Independent of the per-attempt deadline: even a task whose
                // agent keeps answering must finish within the stall bound.
                Err(_) => {
                    return Err(GroveError::SchedulingDeadlock(format!(
                        "session {session_id}: no task completed within {} ms with {} in flight",
                        self.config.stall_timeout_ms,
                        in_flight.len()
                    )))
                }
            }
        }
    }

    async fn dispatch(
        &self,
        session_id: Uuid,
        task: TaskRecord,
        in_flight: &mut JoinSet<TaskCompletion>,
    ) -> GroveResult<()> {
        let slot = match self.acquire_with_retries().await {
            Ok(slot) => slot,
            Err(GroveError::AcquireTimeout(ms)) => {
                warn!(task = %task.id, "no slot within the retry budget, failing task");
                return self
                    .fail_undispatched(
                        session_id,
                        task.id,
                        format!("no context slot available within {ms} ms"),
                    )
                    .await;
            }
            Err(e) => return Err(e),
        };

        let handle = match self.handle_for_slot(session_id, slot).await {
            Ok(handle) => handle,
            // Bind and startup failures have already returned the slot to
            // the pool; the task fails without aborting the session.
            Err(e) => {
                warn!(task = %task.id, error = %e, "agent setup failed, failing task");
                return self
                    .fail_undispatched(session_id, task.id, e.to_string())
                    .await;
            }
        };

        let running = self
            .scheduler
            .mark_running(session_id, task.id, slot)
            .await?;
        self.store.update_task_state(&running).await?;

        let cancel = self.hard_cancel.child_token();
        let task_id = running.id;
        in_flight.spawn(async move {
            let report = handle
                .run_task(&running.description, &running.context, &cancel)
                .await;
            TaskCompletion {
                task_id,
                slot,
                outcome: report.outcome,
                retries: report.retries,
            }
        });
        info!(task = %task_id, slot = %slot, "task dispatched");
        Ok(())
    }

    /// Fails a claimed task that never reached an agent, persisting the
    /// outcome and any skipped dependents.
    async fn fail_undispatched(
        &self,
        session_id: Uuid,
        task_id: Uuid,
        reason: String,
    ) -> GroveResult<()> {
        let changed = self
            .scheduler
            .record_outcome(session_id, task_id, TaskOutcome::Failed { reason }, 0)
            .await?;
        for record in &changed {
            self.store.update_task_state(record).await?;
        }
        Ok(())
    }

    async fn reconcile(&self, session_id: Uuid, completion: TaskCompletion) -> GroveResult<()> {
        let changed = self
            .scheduler
            .record_outcome(
                session_id,
                completion.task_id,
                completion.outcome,
                completion.retries,
            )
            .await?;
        let mut persisted = Ok(());
        for record in &changed {
            if let Err(e) = self.store.update_task_state(record).await {
                persisted = Err(e);
                break;
            }
        }
        let released = self.pool.release(completion.slot);
        persisted?;
        released?;
        info!(task = %completion.task_id, "outcome reconciled");
        Ok(())
    }

    async fn acquire_with_retries(&self) -> GroveResult<Uuid> {
        let timeout = Duration::from_millis(self.config.slot_acquire_timeout_ms);
        let attempts = self.config.slot_acquire_retries.max(1);
        let mut last = None;
        for attempt in 0..attempts {
            match self.pool.acquire(timeout).await {
                Ok(slot) => return Ok(slot),
                Err(e @ GroveError::AcquireTimeout(_)) => {
                    warn!(attempt, "slot acquire timed out");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(GroveError::AcquireTimeout(
            self.config.slot_acquire_timeout_ms,
        )))
    }

    /// Reuses the healthy handle bound to a slot, or builds one: bind the
    /// slot to a fresh checkout if needed, create the agent, start it. A
    /// degraded handle gets one probe; failing that it is rebuilt on the
    /// same checkout.
    async fn handle_for_slot(
        &self,
        session_id: Uuid,
        slot: Uuid,
    ) -> GroveResult<Arc<AgentHandle>> {
        if let Some(existing) = self.handles.read().get(&slot).cloned() {
            match existing.state() {
                HandleState::Ready => return Ok(existing),
                HandleState::Degraded => {
                    if existing.health_check().await == HealthStatus::Healthy {
                        return Ok(existing);
                    }
                    warn!(handle = %existing.id(), slot = %slot, "degraded handle failed probe, rebuilding");
                    existing.terminate();
                    self.handles.write().remove(&slot);
                }
                _ => {
                    self.handles.write().remove(&slot);
                }
            }
        }

        let checkout = match self.pool.binding(slot) {
            Some(checkout) => checkout,
            None => {
                let name = generated_checkout_name();
                let branch = generated_branch_name();
                self.pool
                    .bind(slot, &name, &branch, self.isolation.as_ref())
                    .await?
            }
        };

        let agent = self.agents.create(&checkout);
        let handle = Arc::new(AgentHandle::new(slot, agent, self.config.agent.clone()));
        if let Err(e) = handle.start().await {
            let _ = self.pool.release(slot);
            return Err(e);
        }
        let _ = self.pool.set_holder(slot, handle.id());
        if let Err(e) = self
            .store
            .record_binding(session_id, handle.id(), &checkout.name)
            .await
        {
            // The binding hint is best-effort; losing it only costs a rebind.
            warn!(error = %e, "failed to record binding hint");
        }
        self.handles.write().insert(slot, Arc::clone(&handle));
        Ok(handle)
    }

    async fn report(&self, session_id: Uuid, status: RunStatus) -> GroveResult<SessionReport> {
        let tasks = self.scheduler.tasks(session_id).await?;
        let succeeded = tasks
            .iter()
            .filter(|t| t.state == TaskState::Succeeded)
            .count();
        let failed = tasks.iter().filter(|t| t.state == TaskState::Failed).count();
        let skipped = tasks
            .iter()
            .filter(|t| t.state == TaskState::Skipped)
            .count();
        let summary = format!(
            "{succeeded}/{} tasks succeeded, {failed} failed, {skipped} skipped",
            tasks.len()
        );
        Ok(SessionReport {
            session_id,
            status,
            summary,
            succeeded,
            failed,
            skipped,
            tasks,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
