use crate::records::{SessionRecord, SessionStatus, TaskRecord};
use async_trait::async_trait;
use chrono::Utc;
use grove_core::{GroveError, GroveResult};
use std::path::PathBuf;
use uuid::Uuid;

/// Durable store capability consumed by the orchestrator.
///
/// Every operation is atomic per call; no multi-record transaction is
/// assumed across session and task updates.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persists a new session record.
    async fn create_session(&self, session: &SessionRecord) -> GroveResult<()>;
    /// Loads a session record by id.
    async fn get_session(&self, id: Uuid) -> GroveResult<Option<SessionRecord>>;
    /// Updates the status of an existing session.
    async fn update_session_status(&self, id: Uuid, status: SessionStatus) -> GroveResult<()>;
    /// Records a best-effort resume hint: which checkout an agent handle was
    /// last bound to. Hints are advisory; losing one only costs a rebind.
    async fn record_binding(
        &self,
        session_id: Uuid,
        handle_id: Uuid,
        checkout_name: &str,
    ) -> GroveResult<()>;
    /// Persists a new task record.
    async fn create_task(&self, task: &TaskRecord) -> GroveResult<()>;
    /// Overwrites a task record with its current state.
    async fn update_task_state(&self, task: &TaskRecord) -> GroveResult<()>;
    /// Loads every task belonging to a session, oldest first.
    async fn list_tasks_by_session(&self, session_id: Uuid) -> GroveResult<Vec<TaskRecord>>;
}

/// File-based session store (JSON document per record).
///
/// Layout: `<root>/sessions/<session-id>.json` and
/// `<root>/tasks/<session-id>/<task-id>.json`. A single `tokio::fs::write`
/// per operation keeps each call atomic enough for crash-resume; readers
/// tolerate a torn final write by failing the parse loudly.
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn new(root: PathBuf) -> GroveResult<Self> {
        tokio::fs::create_dir_all(root.join("sessions")).await?;
        tokio::fs::create_dir_all(root.join("tasks")).await?;
        Ok(Self { root })
    }

    fn session_path(&self, id: Uuid) -> PathBuf {
        self.root.join("sessions").join(format!("{id}.json"))
    }

    fn task_dir(&self, session_id: Uuid) -> PathBuf {
        self.root.join("tasks").join(session_id.to_string())
    }

    fn task_path(&self, session_id: Uuid, task_id: Uuid) -> PathBuf {
        self.task_dir(session_id).join(format!("{task_id}.json"))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create_session(&self, session: &SessionRecord) -> GroveResult<()> {
        let json = serde_json::to_string_pretty(session)?;
        tokio::fs::write(self.session_path(session.id), json).await?;
        tokio::fs::create_dir_all(self.task_dir(session.id)).await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> GroveResult<Option<SessionRecord>> {
        let path = self.session_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let session: SessionRecord = serde_json::from_str(&data)
            .map_err(|e| GroveError::Store(format!("failed to parse session {id}: {e}")))?;
        Ok(Some(session))
    }

    async fn update_session_status(&self, id: Uuid, status: SessionStatus) -> GroveResult<()> {
        let mut session = self
            .get_session(id)
            .await?
            .ok_or_else(|| GroveError::Session(format!("session {id} not found")))?;
        session.status = status;
        session.updated_at = Utc::now();
        if matches!(
            status,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Archived
        ) && session.completed_at.is_none()
        {
            session.completed_at = Some(session.updated_at);
        }
        let json = serde_json::to_string_pretty(&session)?;
        tokio::fs::write(self.session_path(id), json).await?;
        Ok(())
    }

    async fn record_binding(
        &self,
        session_id: Uuid,
        handle_id: Uuid,
        checkout_name: &str,
    ) -> GroveResult<()> {
        let mut session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| GroveError::Session(format!("session {session_id} not found")))?;
        session
            .last_bindings
            .insert(handle_id, checkout_name.to_string());
        session.updated_at = Utc::now();
        let json = serde_json::to_string_pretty(&session)?;
        tokio::fs::write(self.session_path(session_id), json).await?;
        Ok(())
    }

    async fn create_task(&self, task: &TaskRecord) -> GroveResult<()> {
        tokio::fs::create_dir_all(self.task_dir(task.session_id)).await?;
        let json = serde_json::to_string_pretty(task)?;
        tokio::fs::write(self.task_path(task.session_id, task.id), json).await?;
        Ok(())
    }

    async fn update_task_state(&self, task: &TaskRecord) -> GroveResult<()> {
        let path = self.task_path(task.session_id, task.id);
        if !path.exists() {
            return Err(GroveError::Store(format!(
                "task {} not found in session {}",
                task.id, task.session_id
            )));
        }
        let json = serde_json::to_string_pretty(task)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    async fn list_tasks_by_session(&self, session_id: Uuid) -> GroveResult<Vec<TaskRecord>> {
        let dir = self.task_dir(session_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let data = tokio::fs::read_to_string(entry.path()).await?;
            let task: TaskRecord = serde_json::from_str(&data).map_err(|e| {
                GroveError::Store(format!(
                    "failed to parse task record {:?}: {e}",
                    entry.path()
                ))
            })?;
            tasks.push(task);
        }
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use grove_core::TaskOutcome;

    async fn temp_store() -> (tempfile::TempDir, FileSessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().to_path_buf()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (_dir, store) = temp_store().await;
        let session = SessionRecord::new("nightly", None);
        store.create_session(&session).await.unwrap();

        let loaded = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.label, "nightly");
        assert_eq!(loaded.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_get_missing_session_is_none() {
        let (_dir, store) = temp_store().await;
        assert!(store.get_session(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_session_status_sets_completed_at() {
        let (_dir, store) = temp_store().await;
        let session = SessionRecord::new("nightly", None);
        store.create_session(&session).await.unwrap();

        store
            .update_session_status(session.id, SessionStatus::Completed)
            .await
            .unwrap();

        let loaded = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_update_status_of_missing_session_errors() {
        let (_dir, store) = temp_store().await;
        let err = store
            .update_session_status(Uuid::new_v4(), SessionStatus::Archived)
            .await
            .unwrap_err();
        assert!(matches!(err, GroveError::Session(_)));
    }

    #[tokio::test]
    async fn test_task_listing_is_oldest_first() {
        let (_dir, store) = temp_store().await;
        let session = SessionRecord::new("ordered", None);
        store.create_session(&session).await.unwrap();

        let mut first = TaskRecord::new(session.id, "first", vec![]);
        let mut second = TaskRecord::new(session.id, "second", vec![first.id]);
        // Force distinct creation times regardless of clock resolution.
        second.created_at = first.created_at + chrono::Duration::milliseconds(5);
        first.retry_count = 1;

        store.create_task(&second).await.unwrap();
        store.create_task(&first).await.unwrap();

        let tasks = store.list_tasks_by_session(session.id).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].description, "first");
        assert_eq!(tasks[1].description, "second");
        assert_eq!(tasks[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_update_task_state_persists_outcome() {
        let (_dir, store) = temp_store().await;
        let session = SessionRecord::new("outcomes", None);
        store.create_session(&session).await.unwrap();

        let mut task = TaskRecord::new(session.id, "flaky", vec![]);
        store.create_task(&task).await.unwrap();

        task.retry_count = 2;
        task.apply_outcome(TaskOutcome::Succeeded {
            result: "ok".into(),
        });
        store.update_task_state(&task).await.unwrap();

        let tasks = store.list_tasks_by_session(session.id).await.unwrap();
        assert_eq!(tasks[0].retry_count, 2);
        assert_eq!(tasks[0].result(), Some("ok"));
    }

    #[tokio::test]
    async fn test_record_binding_round_trip() {
        let (_dir, store) = temp_store().await;
        let session = SessionRecord::new("bindings", None);
        store.create_session(&session).await.unwrap();

        let handle_id = Uuid::new_v4();
        store
            .record_binding(session.id, handle_id, "checkout-ab12cd34")
            .await
            .unwrap();

        let loaded = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.last_bindings.get(&handle_id).map(String::as_str),
            Some("checkout-ab12cd34")
        );
    }

    #[tokio::test]
    async fn test_update_unknown_task_errors() {
        let (_dir, store) = temp_store().await;
        let session = SessionRecord::new("missing", None);
        store.create_session(&session).await.unwrap();

        let task = TaskRecord::new(session.id, "ghost", vec![]);
        let err = store.update_task_state(&task).await.unwrap_err();
        assert!(matches!(err, GroveError::Store(_)));
    }
}
