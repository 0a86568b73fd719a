// src/state_manager.rs

use crate::models::{TaskId, TaskRecord};
use rusqlite::params;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Journal of task records in an SQLite database, so queued and finished
/// tasks survive a restart.
#[derive(Clone)]
pub struct TaskStore {
    conn: Connection,
}

impl TaskStore {
    /// Opens (or creates) the database file and its `tasks` table.
    pub async fn open(db_path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(db_path).await?;
        let store = Self { conn };
        store.setup_database().await?;
        Ok(store)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS tasks (
                        id              TEXT PRIMARY KEY,
                        task_data       TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts or replaces one task.
    pub async fn save_task(&self, task: &TaskRecord) -> Result<(), StateError> {
        self.save_tasks(std::slice::from_ref(task)).await
    }

    /// Writes a batch of tasks in a single transaction.
    pub async fn save_tasks(&self, tasks: &[TaskRecord]) -> Result<(), StateError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let rows = tasks
            .iter()
            .map(|t| Ok((t.id.to_string(), serde_json::to_string(t)?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare("INSERT OR REPLACE INTO tasks (id, task_data) VALUES (?1, ?2)")?;
                    for (id, data) in &rows {
                        stmt.execute(params![id, data])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Loads every stored task. Rows that no longer parse are skipped.
    pub async fn load_all_tasks(&self) -> Result<Vec<TaskRecord>, StateError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT id, task_data FROM tasks")?;
                let iter = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
                let rows: Result<Vec<(String, String)>, rusqlite::Error> = iter.collect();
                Ok(rows?)
            })
            .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for (id, data) in rows {
            match serde_json::from_str::<TaskRecord>(&data) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!("skipping unreadable task row {}: {}", id, e),
            }
        }
        Ok(tasks)
    }

    pub async fn delete_task(&self, id: TaskId) -> Result<(), StateError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
