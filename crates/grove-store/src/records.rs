use chrono::{DateTime, Utc};
use grove_core::{TaskContext, TaskOutcome};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// The session accepts tasks and may be executed.
    Active,
    /// Every task reached a terminal state and outcomes were persisted.
    Completed,
    /// The run aborted (deadlock or persistence failure).
    Failed,
    /// Explicitly archived by the operator. Sessions are never destroyed
    /// implicitly.
    Archived,
}

/// Execution state of a task within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting on unresolved dependencies.
    Pending,
    /// All dependencies resolved; claimed by the scheduler for dispatch.
    Ready,
    /// Currently executing on an agent.
    Running,
    /// Finished with a result payload.
    Succeeded,
    /// Finished with a failure reason.
    Failed,
    /// Never run because an upstream dependency failed.
    Skipped,
}

impl TaskState {
    /// Whether this state is terminal (`Succeeded`, `Failed`, or `Skipped`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }
}

/// Durable record of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique identifier for this session.
    pub id: Uuid,
    /// Human-readable label.
    pub label: String,
    /// Optional longer description.
    pub description: Option<String>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// UTC timestamp of when the session was created.
    pub created_at: DateTime<Utc>,
    /// UTC timestamp of the last record update.
    pub updated_at: DateTime<Utc>,
    /// UTC timestamp of when the session reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Best-effort resume hint: agent handle id → isolation checkout name.
    /// Never authoritative; handles are rebuilt on resume.
    #[serde(default)]
    pub last_bindings: HashMap<Uuid, String>,
}

impl SessionRecord {
    /// Creates a new active session with the given label.
    pub fn new(label: impl Into<String>, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            description,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_bindings: HashMap::new(),
        }
    }
}

/// Durable record of a task.
///
/// The result payload and failure reason live inside the closed
/// [`TaskOutcome`] variant, so they are structurally present only in the
/// matching terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier for this task.
    pub id: Uuid,
    /// The session this task belongs to.
    pub session_id: Uuid,
    /// What the executing agent is asked to do.
    pub description: String,
    /// Current execution state.
    pub state: TaskState,
    /// Task ids that must resolve before this task may run. All must belong
    /// to the same session.
    pub dependencies: Vec<Uuid>,
    /// Extra context handed to the agent alongside the description.
    #[serde(default)]
    pub context: TaskContext,
    /// Terminal outcome; `None` until the task finishes.
    pub outcome: Option<TaskOutcome>,
    /// Number of retried attempts consumed by transient failures.
    pub retry_count: u32,
    /// Context slot the task ran on; set at dispatch, kept after completion.
    pub assigned_slot: Option<Uuid>,
    /// UTC timestamp of when the task was added to the session.
    pub created_at: DateTime<Utc>,
    /// UTC timestamp of when execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// UTC timestamp of when the task reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Creates a new pending task.
    pub fn new(session_id: Uuid, description: impl Into<String>, dependencies: Vec<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            description: description.into(),
            state: TaskState::Pending,
            dependencies,
            context: TaskContext::new(),
            outcome: None,
            retry_count: 0,
            assigned_slot: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Attaches extra context for the executing agent.
    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }

    /// Applies a terminal outcome, setting the matching state and timestamp.
    pub fn apply_outcome(&mut self, outcome: TaskOutcome) {
        self.state = match &outcome {
            TaskOutcome::Succeeded { .. } => TaskState::Succeeded,
            TaskOutcome::Failed { .. } => TaskState::Failed,
            TaskOutcome::Skipped { .. } => TaskState::Skipped,
        };
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
    }

    /// The result payload, present only when the task succeeded.
    pub fn result(&self) -> Option<&str> {
        match &self.outcome {
            Some(TaskOutcome::Succeeded { result }) => Some(result),
            _ => None,
        }
    }

    /// The failure or skip reason, present only in those terminal states.
    pub fn failure_reason(&self) -> Option<&str> {
        self.outcome.as_ref().and_then(TaskOutcome::reason)
    }
}
