//! Task database repository.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{Task, TaskStatus};

/// Repository for task persistence.
#[derive(Debug, Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new task, optionally bound to a repo.
    pub async fn create(&self, title: Option<&str>, repo_id: Option<i64>) -> Result<Task> {
        let id = sqlx::query("INSERT INTO tasks (title, repo_id) VALUES (?, ?)")
            .bind(title)
            .bind(repo_id)
            .execute(&self.pool)
            .await
            .context("creating task")?
            .last_insert_rowid();

        self.get(id)
            .await?
            .context("task missing right after insert")
    }

    /// Get a task by ID.
    pub async fn get(&self, id: i64) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            SELECT id, title, status, repo_id, created_at, updated_at
            FROM tasks
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching task")?;

        Ok(task)
    }

    /// List all tasks, most recently touched first.
    pub async fn list(&self) -> Result<Vec<Task>> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"
            SELECT id, title, status, repo_id, created_at, updated_at
            FROM tasks
            ORDER BY updated_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing tasks")?;

        Ok(tasks)
    }

    /// List IDs of every existing task.
    pub async fn list_ids(&self) -> Result<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM tasks")
            .fetch_all(&self.pool)
            .await
            .context("listing task ids")?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Update task status and touch `updated_at`.
    pub async fn update_status(&self, id: i64, status: TaskStatus) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = ?, updated_at = datetime('now') WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating task status")?;

        Ok(())
    }

    /// Set the task title if it has none yet.
    pub async fn set_title_if_empty(&self, id: i64, title: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tasks SET title = ?, updated_at = datetime('now') WHERE id = ? AND title IS NULL",
        )
        .bind(title)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("setting task title")?;

        Ok(())
    }

    /// Delete a task. Messages and execution sessions cascade via FK.
    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting task")?;

        Ok(())
    }
}
