use crate::config::UpstreamFailurePolicy;
use chrono::Utc;
use grove_core::{GroveError, GroveResult, TaskOutcome};
use grove_store::{TaskRecord, TaskState};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Policy knobs that shape dependency resolution.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphPolicy {
    /// What happens to the dependents of a failed task.
    pub on_upstream_failure: UpstreamFailurePolicy,
    /// Whether a `Skipped` dependency satisfies downstream eligibility.
    pub treat_skipped_as_resolved: bool,
}

/// One session's task dependency graph.
///
/// Tracks, per task, the number of unresolved dependencies; a task becomes
/// eligible when that count reaches zero. Eligibility ties break by
/// insertion order, so equivalent graphs always dispatch deterministically.
/// Mutations are all-or-nothing: a rejected batch leaves the graph
/// untouched.
pub struct TaskGraph {
    session_id: Uuid,
    tasks: HashMap<Uuid, TaskRecord>,
    /// Insertion order of task ids; the eligibility tie-break.
    order: Vec<Uuid>,
    /// Reverse edges: dependency id → ids of tasks waiting on it.
    dependents: HashMap<Uuid, Vec<Uuid>>,
    /// Count of not-yet-favorably-resolved dependencies per task.
    unresolved: HashMap<Uuid, usize>,
    policy: GraphPolicy,
}

impl TaskGraph {
    /// Creates an empty graph for a session.
    pub fn new(session_id: Uuid, policy: GraphPolicy) -> Self {
        Self {
            session_id,
            tasks: HashMap::new(),
            order: Vec::new(),
            dependents: HashMap::new(),
            unresolved: HashMap::new(),
            policy,
        }
    }

    /// Rebuilds a graph from persisted records (crash resume).
    ///
    /// Tasks that were `Ready` or `Running` when the process died are
    /// re-queued as `Pending`; their slot assignment and start time are
    /// cleared since slots and handles do not survive a restart. Terminal
    /// states are preserved as resolved history.
    pub fn from_records(
        session_id: Uuid,
        policy: GraphPolicy,
        records: Vec<TaskRecord>,
    ) -> GroveResult<Self> {
        let mut graph = Self::new(session_id, policy);
        let mut normalized = Vec::with_capacity(records.len());
        for mut record in records {
            if matches!(record.state, TaskState::Ready | TaskState::Running) {
                record.state = TaskState::Pending;
                record.assigned_slot = None;
                record.started_at = None;
            }
            normalized.push(record);
        }
        graph.insert_records(normalized)?;
        Ok(graph)
    }

    /// Inserts a batch of new pending tasks atomically.
    ///
    /// Dependencies may point at existing tasks or at other members of the
    /// batch. Fails with [`GroveError::UnknownDependency`] when a dependency
    /// id is not a member of the session, and with [`GroveError::Cycle`]
    /// when the edge set admits no topological order; in both cases the
    /// graph is left unchanged.
    pub fn insert_batch(&mut self, batch: Vec<TaskRecord>) -> GroveResult<Vec<Uuid>> {
        for task in &batch {
            if task.session_id != self.session_id {
                return Err(GroveError::Session(format!(
                    "task {} belongs to session {}, not {}",
                    task.id, task.session_id, self.session_id
                )));
            }
            if task.state != TaskState::Pending {
                return Err(GroveError::Session(format!(
                    "task {} inserted in non-pending state {:?}",
                    task.id, task.state
                )));
            }
        }
        self.insert_records(batch)
    }

    fn insert_records(&mut self, batch: Vec<TaskRecord>) -> GroveResult<Vec<Uuid>> {
        let batch_ids: HashSet<Uuid> = batch.iter().map(|t| t.id).collect();

        // Membership: every dependency resolves within the session.
        for task in &batch {
            for dep in &task.dependencies {
                if !self.tasks.contains_key(dep) && !batch_ids.contains(dep) {
                    return Err(GroveError::UnknownDependency(*dep, self.session_id));
                }
            }
        }

        // Topological feasibility over the would-be graph. The existing
        // graph is already acyclic and never gains edges, so any new cycle
        // passes through the batch; a DFS from each batch node suffices.
        let mut adjacency: HashMap<Uuid, &[Uuid]> = HashMap::new();
        for task in self.tasks.values() {
            adjacency.insert(task.id, &task.dependencies);
        }
        for task in &batch {
            adjacency.insert(task.id, &task.dependencies);
        }
        let mut colors: HashMap<Uuid, u8> = HashMap::new();
        for task in &batch {
            if dfs_cycle(task.id, &adjacency, &mut colors) {
                return Err(GroveError::Cycle(format!(
                    "task {} participates in a dependency cycle",
                    task.id
                )));
            }
        }

        // Commit. Resolution state is looked up across existing tasks and
        // the batch itself, so forward references inside one batch count
        // correctly even when the referenced task is already terminal
        // (hydrate after a crash).
        let mut states: HashMap<Uuid, TaskState> =
            self.tasks.iter().map(|(id, t)| (*id, t.state)).collect();
        for task in &batch {
            states.insert(task.id, task.state);
        }
        let treat_skipped = self.policy.treat_skipped_as_resolved;
        let favorably_resolved = move |state: Option<&TaskState>| match state {
            Some(TaskState::Succeeded) => true,
            Some(TaskState::Skipped) => treat_skipped,
            _ => false,
        };

        let mut inserted = Vec::with_capacity(batch.len());
        for mut task in batch {
            dedup_in_place(&mut task.dependencies);
            let pending_deps = task
                .dependencies
                .iter()
                .filter(|dep| !favorably_resolved(states.get(dep)))
                .count();
            for dep in &task.dependencies {
                self.dependents.entry(*dep).or_default().push(task.id);
            }
            let unresolved = if task.state == TaskState::Pending {
                pending_deps
            } else {
                0
            };
            self.unresolved.insert(task.id, unresolved);
            self.order.push(task.id);
            inserted.push(task.id);
            debug!(
                session = %self.session_id,
                task = %task.id,
                unresolved,
                "task inserted"
            );
            self.tasks.insert(task.id, task);
        }
        Ok(inserted)
    }

    /// Claims the oldest pending task whose dependencies are all resolved
    /// favorably, transitioning it to `Ready`. Returns `None` when nothing
    /// is eligible.
    pub fn next_eligible(&mut self) -> Option<TaskRecord> {
        let id = self.order.iter().copied().find(|id| {
            self.tasks.get(id).map(|t| t.state) == Some(TaskState::Pending)
                && self.unresolved.get(id).copied() == Some(0)
        })?;
        let task = self.tasks.get_mut(&id)?;
        task.state = TaskState::Ready;
        Some(task.clone())
    }

    /// Whether any pending task is currently eligible.
    pub fn has_eligible(&self) -> bool {
        self.order.iter().any(|id| {
            self.tasks.get(id).map(|t| t.state) == Some(TaskState::Pending)
                && self.unresolved.get(id).copied() == Some(0)
        })
    }

    /// Marks a claimed task as running on the given slot.
    pub fn mark_running(&mut self, id: Uuid, slot: Uuid) -> GroveResult<TaskRecord> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or_else(|| GroveError::Session(format!("unknown task {id}")))?;
        if task.state != TaskState::Ready {
            return Err(GroveError::Session(format!(
                "task {id} cannot run from state {:?}",
                task.state
            )));
        }
        task.state = TaskState::Running;
        task.started_at = Some(Utc::now());
        task.assigned_slot = Some(slot);
        Ok(task.clone())
    }

    /// Records a terminal outcome and propagates its consequences.
    ///
    /// On failure, transitive dependents are skipped with reason
    /// "upstream failure" under [`UpstreamFailurePolicy::SkipDependents`];
    /// under `LeavePending` they are left alone. Returns every record that
    /// changed so the caller can persist them.
    pub fn record_outcome(
        &mut self,
        id: Uuid,
        outcome: TaskOutcome,
        retries: u32,
    ) -> GroveResult<Vec<TaskRecord>> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or_else(|| GroveError::Session(format!("unknown task {id}")))?;
        if task.state.is_terminal() {
            return Err(GroveError::Session(format!(
                "task {id} already terminal ({:?})",
                task.state
            )));
        }
        task.retry_count = retries;
        task.apply_outcome(outcome.clone());
        let mut changed = vec![task.clone()];

        match &outcome {
            TaskOutcome::Succeeded { .. } => self.resolve_dependents_of(id),
            TaskOutcome::Skipped { .. } => {
                if self.policy.treat_skipped_as_resolved {
                    self.resolve_dependents_of(id);
                }
            }
            TaskOutcome::Failed { .. } => {
                if self.policy.on_upstream_failure == UpstreamFailurePolicy::SkipDependents {
                    changed.extend(self.skip_transitive_dependents(id));
                }
            }
        }

        info!(
            session = %self.session_id,
            task = %id,
            outcome = ?outcome,
            propagated = changed.len() - 1,
            "outcome recorded"
        );
        Ok(changed)
    }

    fn resolve_dependents_of(&mut self, id: Uuid) {
        for dependent in self.dependents.get(&id).cloned().unwrap_or_default() {
            if let Some(count) = self.unresolved.get_mut(&dependent) {
                *count = count.saturating_sub(1);
            }
        }
    }

    fn skip_transitive_dependents(&mut self, id: Uuid) -> Vec<TaskRecord> {
        let mut skipped = Vec::new();
        let mut stack = self.dependents.get(&id).cloned().unwrap_or_default();
        while let Some(next) = stack.pop() {
            let Some(task) = self.tasks.get_mut(&next) else {
                continue;
            };
            if task.state.is_terminal() {
                continue;
            }
            task.apply_outcome(TaskOutcome::Skipped {
                reason: "upstream failure".to_string(),
            });
            skipped.push(task.clone());
            stack.extend(self.dependents.get(&next).cloned().unwrap_or_default());
        }
        skipped
    }

    /// Whether every task is in a terminal state.
    pub fn is_complete(&self) -> bool {
        self.tasks.values().all(|t| t.state.is_terminal())
    }

    /// Number of tasks not yet terminal.
    pub fn non_terminal_count(&self) -> usize {
        self.tasks.values().filter(|t| !t.state.is_terminal()).count()
    }

    /// Task count per state, for session-level reporting.
    pub fn counts(&self) -> HashMap<TaskState, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.state).or_insert(0) += 1;
        }
        counts
    }

    /// Snapshot of every task in insertion order.
    pub fn tasks(&self) -> Vec<TaskRecord> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .cloned()
            .collect()
    }

    /// Looks up a task by id.
    pub fn get(&self, id: Uuid) -> Option<&TaskRecord> {
        self.tasks.get(&id)
    }

    /// Total number of tasks.
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }
}

/// DFS coloring over the dependency edges; `true` when a cycle is reachable.
fn dfs_cycle(id: Uuid, adjacency: &HashMap<Uuid, &[Uuid]>, colors: &mut HashMap<Uuid, u8>) -> bool {
    match colors.get(&id) {
        Some(1) => return true,  // back edge = cycle
        Some(2) => return false, // already processed
        _ => {}
    }
    colors.insert(id, 1); // mark as in progress
    if let Some(deps) = adjacency.get(&id) {
        for dep in *deps {
            if dfs_cycle(*dep, adjacency, colors) {
                return true;
            }
        }
    }
    colors.insert(id, 2); // mark as done
    false
}

fn dedup_in_place(deps: &mut Vec<Uuid>) {
    let mut seen = HashSet::new();
    deps.retain(|d| seen.insert(*d));
}

/// Async facade over per-session [`TaskGraph`]s.
///
/// All mutations funnel through one writer lock, so dependency resolution
/// is serialized per session and concurrent `next_eligible` callers can
/// never claim the same task.
pub struct DependencyScheduler {
    policy: GraphPolicy,
    sessions: RwLock<HashMap<Uuid, TaskGraph>>,
}

impl DependencyScheduler {
    /// Creates a scheduler applying `policy` to every session it manages.
    pub fn new(policy: GraphPolicy) -> Self {
        Self {
            policy,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an empty graph for a new session.
    pub async fn open_session(&self, session_id: Uuid) -> GroveResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session_id) {
            return Err(GroveError::Session(format!(
                "session {session_id} already open"
            )));
        }
        sessions.insert(session_id, TaskGraph::new(session_id, self.policy));
        Ok(())
    }

    /// Registers a graph rebuilt from persisted records (crash resume).
    pub async fn hydrate_session(
        &self,
        session_id: Uuid,
        records: Vec<TaskRecord>,
    ) -> GroveResult<()> {
        let graph = TaskGraph::from_records(session_id, self.policy, records)?;
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session_id) {
            return Err(GroveError::Session(format!(
                "session {session_id} already open"
            )));
        }
        sessions.insert(session_id, graph);
        Ok(())
    }

    /// Adds one task with the given dependencies, returning its record.
    pub async fn add_task(
        &self,
        session_id: Uuid,
        description: impl Into<String>,
        dependencies: Vec<Uuid>,
    ) -> GroveResult<TaskRecord> {
        let task = TaskRecord::new(session_id, description, dependencies);
        let id = task.id;
        let mut sessions = self.sessions.write().await;
        let graph = graph_mut(&mut sessions, session_id)?;
        graph.insert_batch(vec![task])?;
        graph
            .get(id)
            .cloned()
            .ok_or_else(|| GroveError::Session(format!("task {id} vanished after insert")))
    }

    /// Adds a batch of pre-built task records atomically.
    pub async fn add_batch(
        &self,
        session_id: Uuid,
        batch: Vec<TaskRecord>,
    ) -> GroveResult<Vec<Uuid>> {
        let mut sessions = self.sessions.write().await;
        graph_mut(&mut sessions, session_id)?.insert_batch(batch)
    }

    /// Claims the next eligible task, if any.
    pub async fn next_eligible(&self, session_id: Uuid) -> GroveResult<Option<TaskRecord>> {
        let mut sessions = self.sessions.write().await;
        Ok(graph_mut(&mut sessions, session_id)?.next_eligible())
    }

    /// Marks a claimed task as running on a slot.
    pub async fn mark_running(
        &self,
        session_id: Uuid,
        task_id: Uuid,
        slot: Uuid,
    ) -> GroveResult<TaskRecord> {
        let mut sessions = self.sessions.write().await;
        graph_mut(&mut sessions, session_id)?.mark_running(task_id, slot)
    }

    /// Records an outcome; returns every record that changed.
    pub async fn record_outcome(
        &self,
        session_id: Uuid,
        task_id: Uuid,
        outcome: TaskOutcome,
        retries: u32,
    ) -> GroveResult<Vec<TaskRecord>> {
        let mut sessions = self.sessions.write().await;
        graph_mut(&mut sessions, session_id)?.record_outcome(task_id, outcome, retries)
    }

    /// Whether every task in the session is terminal.
    pub async fn is_session_complete(&self, session_id: Uuid) -> GroveResult<bool> {
        let sessions = self.sessions.read().await;
        Ok(graph_ref(&sessions, session_id)?.is_complete())
    }

    /// Whether any pending task is currently eligible.
    pub async fn has_eligible(&self, session_id: Uuid) -> GroveResult<bool> {
        let sessions = self.sessions.read().await;
        Ok(graph_ref(&sessions, session_id)?.has_eligible())
    }

    /// Number of non-terminal tasks in the session.
    pub async fn non_terminal_count(&self, session_id: Uuid) -> GroveResult<usize> {
        let sessions = self.sessions.read().await;
        Ok(graph_ref(&sessions, session_id)?.non_terminal_count())
    }

    /// Task count per state.
    pub async fn counts(&self, session_id: Uuid) -> GroveResult<HashMap<TaskState, usize>> {
        let sessions = self.sessions.read().await;
        Ok(graph_ref(&sessions, session_id)?.counts())
    }

    /// Snapshot of every task in insertion order.
    pub async fn tasks(&self, session_id: Uuid) -> GroveResult<Vec<TaskRecord>> {
        let sessions = self.sessions.read().await;
        Ok(graph_ref(&sessions, session_id)?.tasks())
    }
}

fn graph_mut(
    sessions: &mut HashMap<Uuid, TaskGraph>,
    session_id: Uuid,
) -> GroveResult<&mut TaskGraph> {
    sessions
        .get_mut(&session_id)
        .ok_or_else(|| GroveError::Session(format!("session {session_id} not open")))
}

fn graph_ref(sessions: &HashMap<Uuid, TaskGraph>, session_id: Uuid) -> GroveResult<&TaskGraph> {
    sessions
        .get(&session_id)
        .ok_or_else(|| GroveError::Session(format!("session {session_id} not open")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn graph() -> TaskGraph {
        TaskGraph::new(Uuid::new_v4(), GraphPolicy::default())
    }

    fn task(graph: &TaskGraph, description: &str, deps: Vec<Uuid>) -> TaskRecord {
        TaskRecord::new(graph.session_id, description, deps)
    }

    fn succeed(graph: &mut TaskGraph, id: Uuid) {
        let claimed = graph.next_eligible().unwrap();
        assert_eq!(claimed.id, id);
        graph.mark_running(id, Uuid::new_v4()).unwrap();
        graph
            .record_outcome(id, TaskOutcome::Succeeded { result: "ok".into() }, 0)
            .unwrap();
    }

    #[test]
    fn test_empty_graph() {
        let mut g = graph();
        assert!(g.is_complete());
        assert!(g.next_eligible().is_none());
        assert_eq!(g.total_count(), 0);
    }

    #[test]
    fn test_next_eligible_claims_once() {
        let mut g = graph();
        let t = task(&g, "solo", vec![]);
        let id = t.id;
        g.insert_batch(vec![t]).unwrap();

        let claimed = g.next_eligible().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.state, TaskState::Ready);
        // A claimed task is never handed out twice.
        assert!(g.next_eligible().is_none());
    }

    #[test]
    fn test_insertion_order_tie_break() {
        let mut g = graph();
        let a = task(&g, "a", vec![]);
        let b = task(&g, "b", vec![]);
        let c = task(&g, "c", vec![]);
        let ids = [a.id, b.id, c.id];
        g.insert_batch(vec![a, b, c]).unwrap();

        for expected in ids {
            assert_eq!(g.next_eligible().unwrap().id, expected);
        }
    }

    #[test]
    fn test_dependency_gates_eligibility() {
        let mut g = graph();
        let a = task(&g, "a", vec![]);
        let a_id = a.id;
        let b = task(&g, "b", vec![a_id]);
        let b_id = b.id;
        g.insert_batch(vec![a, b]).unwrap();

        succeed(&mut g, a_id);
        let next = g.next_eligible().unwrap();
        assert_eq!(next.id, b_id);
    }

    #[test]
    fn test_unknown_dependency_rejected_without_mutation() {
        let mut g = graph();
        let t = task(&g, "orphan", vec![Uuid::new_v4()]);
        let err = g.insert_batch(vec![t]).unwrap_err();
        assert!(matches!(err, GroveError::UnknownDependency(_, _)));
        assert_eq!(g.total_count(), 0);
    }

    #[test]
    fn test_cycle_rejected_without_mutation() {
        let mut g = graph();
        let mut a = task(&g, "a", vec![]);
        let mut b = task(&g, "b", vec![]);
        a.dependencies = vec![b.id];
        b.dependencies = vec![a.id];

        let err = g.insert_batch(vec![a, b]).unwrap_err();
        assert!(matches!(err, GroveError::Cycle(_)));
        assert_eq!(g.total_count(), 0);
        assert!(g.next_eligible().is_none());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut g = graph();
        let mut t = task(&g, "narcissist", vec![]);
        t.dependencies = vec![t.id];
        let err = g.insert_batch(vec![t]).unwrap_err();
        assert!(matches!(err, GroveError::Cycle(_)));
        assert_eq!(g.total_count(), 0);
    }

    #[test]
    fn test_failure_skips_transitive_dependents() {
        let mut g = graph();
        let a = task(&g, "a", vec![]);
        let a_id = a.id;
        let b = task(&g, "b", vec![a_id]);
        let b_id = b.id;
        let c = task(&g, "c", vec![b_id]);
        let c_id = c.id;
        g.insert_batch(vec![a, b, c]).unwrap();

        g.next_eligible().unwrap();
        g.mark_running(a_id, Uuid::new_v4()).unwrap();
        let changed = g
            .record_outcome(
                a_id,
                TaskOutcome::Failed {
                    reason: "boom".into(),
                },
                0,
            )
            .unwrap();

        // A itself plus both transitive dependents.
        assert_eq!(changed.len(), 3);
        assert_eq!(g.get(b_id).unwrap().state, TaskState::Skipped);
        assert_eq!(g.get(c_id).unwrap().state, TaskState::Skipped);
        assert_eq!(
            g.get(c_id).unwrap().failure_reason(),
            Some("upstream failure")
        );
        assert!(g.is_complete());
    }

    #[test]
    fn test_leave_pending_policy_blocks_dependents() {
        let policy = GraphPolicy {
            on_upstream_failure: UpstreamFailurePolicy::LeavePending,
            treat_skipped_as_resolved: false,
        };
        let mut g = TaskGraph::new(Uuid::new_v4(), policy);
        let a = task(&g, "a", vec![]);
        let a_id = a.id;
        let b = task(&g, "b", vec![a_id]);
        let b_id = b.id;
        g.insert_batch(vec![a, b]).unwrap();

        g.next_eligible().unwrap();
        g.mark_running(a_id, Uuid::new_v4()).unwrap();
        let changed = g
            .record_outcome(
                a_id,
                TaskOutcome::Failed {
                    reason: "boom".into(),
                },
                0,
            )
            .unwrap();

        assert_eq!(changed.len(), 1);
        assert_eq!(g.get(b_id).unwrap().state, TaskState::Pending);
        assert!(!g.has_eligible());
        assert!(!g.is_complete()); // the operator-intervention signal
    }

    #[test]
    fn test_skipped_dependency_policy() {
        // Default: a skipped dependency does not unlock dependents.
        let mut strict = graph();
        let a = task(&strict, "a", vec![]);
        let a_id = a.id;
        let b = task(&strict, "b", vec![a_id]);
        strict.insert_batch(vec![a, b]).unwrap();
        strict.next_eligible().unwrap();
        strict
            .record_outcome(
                a_id,
                TaskOutcome::Skipped {
                    reason: "operator".into(),
                },
                0,
            )
            .unwrap();
        assert!(!strict.has_eligible());

        // With treat_skipped_as_resolved, the dependent becomes eligible.
        let policy = GraphPolicy {
            on_upstream_failure: UpstreamFailurePolicy::SkipDependents,
            treat_skipped_as_resolved: true,
        };
        let mut lenient = TaskGraph::new(Uuid::new_v4(), policy);
        let a = task(&lenient, "a", vec![]);
        let a_id = a.id;
        let b = task(&lenient, "b", vec![a_id]);
        let b_id = b.id;
        lenient.insert_batch(vec![a, b]).unwrap();
        lenient.next_eligible().unwrap();
        lenient
            .record_outcome(
                a_id,
                TaskOutcome::Skipped {
                    reason: "operator".into(),
                },
                0,
            )
            .unwrap();
        assert_eq!(lenient.next_eligible().unwrap().id, b_id);
    }

    #[test]
    fn test_record_outcome_twice_is_an_error() {
        let mut g = graph();
        let t = task(&g, "once", vec![]);
        let id = t.id;
        g.insert_batch(vec![t]).unwrap();
        g.next_eligible().unwrap();
        g.record_outcome(id, TaskOutcome::Succeeded { result: "ok".into() }, 0)
            .unwrap();

        let err = g
            .record_outcome(id, TaskOutcome::Succeeded { result: "again".into() }, 0)
            .unwrap_err();
        assert!(matches!(err, GroveError::Session(_)));
    }

    #[test]
    fn test_duplicate_dependencies_counted_once() {
        let mut g = graph();
        let a = task(&g, "a", vec![]);
        let a_id = a.id;
        let b = task(&g, "b", vec![a_id, a_id, a_id]);
        let b_id = b.id;
        g.insert_batch(vec![a, b]).unwrap();

        succeed(&mut g, a_id);
        assert_eq!(g.next_eligible().unwrap().id, b_id);
    }

    #[test]
    fn test_counts_summary() {
        let mut g = graph();
        let a = task(&g, "a", vec![]);
        let a_id = a.id;
        let b = task(&g, "b", vec![a_id]);
        g.insert_batch(vec![a, b]).unwrap();

        g.next_eligible().unwrap();
        g.mark_running(a_id, Uuid::new_v4()).unwrap();
        let counts = g.counts();
        assert_eq!(counts.get(&TaskState::Running), Some(&1));
        assert_eq!(counts.get(&TaskState::Pending), Some(&1));
    }

    #[test]
    fn test_hydrate_requeues_interrupted_work() {
        let session_id = Uuid::new_v4();
        let mut a = TaskRecord::new(session_id, "done", vec![]);
        a.apply_outcome(TaskOutcome::Succeeded { result: "ok".into() });
        let a_id = a.id;

        let mut b = TaskRecord::new(session_id, "was running", vec![a_id]);
        b.state = TaskState::Running;
        b.assigned_slot = Some(Uuid::new_v4());
        b.started_at = Some(Utc::now());
        let b_id = b.id;

        let c = TaskRecord::new(session_id, "still pending", vec![b_id]);
        let c_id = c.id;

        let mut g =
            TaskGraph::from_records(session_id, GraphPolicy::default(), vec![a, b, c]).unwrap();

        // The interrupted task is immediately eligible again, slot cleared.
        let requeued = g.next_eligible().unwrap();
        assert_eq!(requeued.id, b_id);
        assert!(requeued.assigned_slot.is_none());
        // Terminal history is preserved and the chain still gates c.
        assert_eq!(g.get(a_id).unwrap().state, TaskState::Succeeded);
        assert_eq!(g.get(c_id).unwrap().state, TaskState::Pending);
        assert!(!g.has_eligible());
    }

    #[tokio::test]
    async fn test_scheduler_facade_round_trip() {
        let scheduler = DependencyScheduler::new(GraphPolicy::default());
        let session = Uuid::new_v4();
        scheduler.open_session(session).await.unwrap();

        let a = scheduler.add_task(session, "a", vec![]).await.unwrap();
        let b = scheduler.add_task(session, "b", vec![a.id]).await.unwrap();

        let claimed = scheduler.next_eligible(session).await.unwrap().unwrap();
        assert_eq!(claimed.id, a.id);
        scheduler
            .mark_running(session, a.id, Uuid::new_v4())
            .await
            .unwrap();
        scheduler
            .record_outcome(session, a.id, TaskOutcome::Succeeded { result: "ok".into() }, 0)
            .await
            .unwrap();

        let claimed = scheduler.next_eligible(session).await.unwrap().unwrap();
        assert_eq!(claimed.id, b.id);
        assert!(!scheduler.is_session_complete(session).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_claims_hand_out_each_task_once() {
        let scheduler = std::sync::Arc::new(DependencyScheduler::new(GraphPolicy::default()));
        let session = Uuid::new_v4();
        scheduler.open_session(session).await.unwrap();
        for i in 0..4 {
            scheduler
                .add_task(session, format!("t{i}"), vec![])
                .await
                .unwrap();
        }

        let mut joins = Vec::new();
        for _ in 0..16 {
            let scheduler = std::sync::Arc::clone(&scheduler);
            joins.push(tokio::spawn(async move {
                scheduler.next_eligible(session).await.unwrap()
            }));
        }
        let mut claimed = Vec::new();
        for join in joins {
            if let Some(task) = join.await.unwrap() {
                claimed.push(task.id);
            }
        }
        claimed.sort();
        claimed.dedup();
        assert_eq!(claimed.len(), 4); // each task claimed exactly once
    }

    #[tokio::test]
    async fn test_unknown_session_errors() {
        let scheduler = DependencyScheduler::new(GraphPolicy::default());
        let err = scheduler.next_eligible(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, GroveError::Session(_)));
    }
}
