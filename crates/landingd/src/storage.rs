//! Task persistence for the landing daemon.
//!
//! `TaskStore` is the storage collaborator used by the finalize pipeline,
//! trigger and PR poller. `SqliteStore` keeps one JSON document per task
//! with indexed summary columns; `MemoryStore` backs tests and
//! `--ephemeral` runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use landing_core::{Id, Task};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Task CRUD consumed by the finalize and polling subsystems.
///
/// Implementations serialize each individual read or write; callers do
/// their own read-modify-write.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load_task(&self, id: &Id) -> Result<Task>;
    /// Insert or replace a task.
    async fn save_task(&self, task: &Task) -> Result<()>;
    async fn load_all_tasks(&self) -> Result<Vec<Task>>;
    async fn delete_task(&self, id: &Id) -> Result<()>;
    /// Record the textual output of a phase, replacing any earlier output.
    async fn save_phase_output(&self, task_id: &Id, phase: &str, output: &str) -> Result<()>;
    async fn load_phase_output(&self, task_id: &Id, phase: &str) -> Result<Option<String>>;
}

// --- SQLite ---

/// SQLite-backed task store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the compiled-in schema. Safe to call on every start.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    document: String,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(serde_json::from_str(&self.document)?)
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn load_task(&self, id: &Id) -> Result<Task> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT document FROM tasks WHERE id = ?1")
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))?;
        row.into_task()
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let document = serde_json::to_string(task)?;
        let pr_url = task.pr.as_ref().map(|pr| pr.url.as_str());
        let pr_status = task.pr.as_ref().map(|pr| pr.status.as_str());

        sqlx::query(
            r"
            INSERT INTO tasks (id, title, status, weight, pr_url, pr_status, document, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                status = excluded.status,
                weight = excluded.weight,
                pr_url = excluded.pr_url,
                pr_status = excluded.pr_status,
                document = excluded.document,
                updated_at = excluded.updated_at
            ",
        )
        .bind(task.id.as_ref())
        .bind(&task.title)
        .bind(task.status.as_str())
        .bind(task.weight.as_str())
        .bind(pr_url)
        .bind(pr_status)
        .bind(&document)
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_all_tasks(&self) -> Result<Vec<Task>> {
        let rows =
            sqlx::query_as::<_, TaskRow>("SELECT document FROM tasks ORDER BY created_at ASC")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn delete_task(&self, id: &Id) -> Result<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::TaskNotFound(id.to_string()));
        }
        sqlx::query("DELETE FROM phase_outputs WHERE task_id = ?1")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_phase_output(&self, task_id: &Id, phase: &str, output: &str) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO phase_outputs (task_id, phase, output, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(task_id, phase) DO UPDATE SET
                output = excluded.output,
                updated_at = excluded.updated_at
            ",
        )
        .bind(task_id.as_ref())
        .bind(phase)
        .bind(output)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_phase_output(&self, task_id: &Id, phase: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT output FROM phase_outputs WHERE task_id = ?1 AND phase = ?2")
                .bind(task_id.as_ref())
                .bind(phase)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }
}

// --- In-memory ---

/// Thread-safe in-memory task store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: HashMap<Id, Task>,
    outputs: HashMap<(Id, String), (String, DateTime<Utc>)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `tasks`.
    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let store = Self::new();
        if let Ok(mut state) = store.state.write() {
            for task in tasks {
                state.tasks.insert(task.id.clone(), task);
            }
        }
        store
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn load_task(&self, id: &Id) -> Result<Task> {
        let state = self.state.read().map_err(|_| StorageError::Poisoned)?;
        state
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.write().map_err(|_| StorageError::Poisoned)?;
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn load_all_tasks(&self) -> Result<Vec<Task>> {
        let state = self.state.read().map_err(|_| StorageError::Poisoned)?;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    async fn delete_task(&self, id: &Id) -> Result<()> {
        let mut state = self.state.write().map_err(|_| StorageError::Poisoned)?;
        if state.tasks.remove(id).is_none() {
            return Err(StorageError::TaskNotFound(id.to_string()));
        }
        state.outputs.retain(|(task_id, _), _| task_id != id);
        Ok(())
    }

    async fn save_phase_output(&self, task_id: &Id, phase: &str, output: &str) -> Result<()> {
        let mut state = self.state.write().map_err(|_| StorageError::Poisoned)?;
        state.outputs.insert(
            (task_id.clone(), phase.to_string()),
            (output.to_string(), Utc::now()),
        );
        Ok(())
    }

    async fn load_phase_output(&self, task_id: &Id, phase: &str) -> Result<Option<String>> {
        let state = self.state.read().map_err(|_| StorageError::Poisoned)?;
        Ok(state
            .outputs
            .get(&(task_id.clone(), phase.to_string()))
            .map(|(output, _)| output.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use landing_core::{PrInfo, PrStatus, TaskStatus, TaskWeight, FINALIZE_PHASE};
    use tempfile::TempDir;

    struct TestStore {
        store: SqliteStore,
        _dir: TempDir, // Keep alive to prevent cleanup
    }

    async fn create_test_store() -> TestStore {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let store = SqliteStore::new(&db_path).await.unwrap();
        store.migrate_embedded().await.unwrap();
        TestStore { store, _dir: dir }
    }

    fn create_test_task() -> Task {
        let mut task = Task::new(Id::new(), "Add retry to uploader", TaskWeight::Medium);
        task.status = TaskStatus::Completed;
        task.pr = Some(PrInfo {
            url: "https://github.com/acme/app/pull/7".to_string(),
            number: Some(7),
            status: PrStatus::PendingReview,
            ..PrInfo::default()
        });
        task
    }

    #[tokio::test]
    async fn save_and_load_task() {
        let ts = create_test_store().await;
        let task = create_test_task();

        ts.store.save_task(&task).await.unwrap();
        let loaded = ts.store.load_task(&task.id).await.unwrap();

        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.pr_status(), PrStatus::PendingReview);
    }

    #[tokio::test]
    async fn save_task_replaces_existing_document() {
        let ts = create_test_store().await;
        let mut task = create_test_task();
        ts.store.save_task(&task).await.unwrap();

        task.execution.start_phase(FINALIZE_PHASE);
        task.execution
            .complete_phase(FINALIZE_PHASE, Some("abc123".to_string()));
        ts.store.save_task(&task).await.unwrap();

        let loaded = ts.store.load_task(&task.id).await.unwrap();
        assert!(loaded.is_finalized());
        assert_eq!(ts.store.load_all_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_task_removes_outputs() {
        let ts = create_test_store().await;
        let task = create_test_task();
        ts.store.save_task(&task).await.unwrap();
        ts.store
            .save_phase_output(&task.id, FINALIZE_PHASE, "merged main")
            .await
            .unwrap();

        ts.store.delete_task(&task.id).await.unwrap();

        assert!(matches!(
            ts.store.load_task(&task.id).await,
            Err(StorageError::TaskNotFound(_))
        ));
        assert!(ts
            .store
            .load_phase_output(&task.id, FINALIZE_PHASE)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn phase_output_is_replaced() {
        let ts = create_test_store().await;
        let id = Id::new();
        ts.store.save_phase_output(&id, "finalize", "one").await.unwrap();
        ts.store.save_phase_output(&id, "finalize", "two").await.unwrap();

        let output = ts.store.load_phase_output(&id, "finalize").await.unwrap();
        assert_eq!(output.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(&dir.path().join("test.db")).await.unwrap();

        store.migrate_embedded().await.unwrap();
        store.migrate_embedded().await.unwrap();

        store.save_task(&create_test_task()).await.unwrap();
    }

    #[tokio::test]
    async fn load_task_not_found() {
        let ts = create_test_store().await;
        let result = ts.store.load_task(&Id::new()).await;
        assert!(matches!(result, Err(StorageError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let task = create_test_task();
        let store = MemoryStore::with_tasks([task.clone()]);

        assert_eq!(store.load_task(&task.id).await.unwrap().title, task.title);
        store.delete_task(&task.id).await.unwrap();
        assert!(store.load_all_tasks().await.unwrap().is_empty());
        assert!(matches!(
            store.delete_task(&task.id).await,
            Err(StorageError::TaskNotFound(_))
        ));
    }
}
