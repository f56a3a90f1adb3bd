//! Repo database repository, including the persistent repo lock.
//!
//! The lock is database-enforced so it survives crashes and holds across
//! multiple orchestrator replicas. SQLite has no `SELECT … FOR UPDATE`;
//! acquisition runs a read-then-set inside one transaction and relies on
//! SQLite's single-writer serialization (WAL + busy timeout), which makes
//! lock acquisitions linearizable for this schema.

use anyhow::{Context, Result};
use log::info;
use sqlx::SqlitePool;
use thiserror::Error;

use super::models::Repo;

/// Failure to acquire a repo lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// The repo row does not exist.
    #[error("repo not found: {0}")]
    RepoNotFound(i64),

    /// Another task holds the lock.
    #[error("repo locked by task {0}")]
    LockedBy(i64),

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for repo persistence and locking.
#[derive(Debug, Clone)]
pub struct RepoRepository {
    pool: SqlitePool,
}

impl RepoRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Find a repo by remote URL, creating it on first use.
    pub async fn find_or_create(
        &self,
        remote_url: &str,
        display_name: &str,
        default_branch: &str,
    ) -> Result<Repo> {
        if let Some(repo) = self.get_by_remote_url(remote_url).await? {
            return Ok(repo);
        }

        let id = sqlx::query(
            "INSERT INTO repos (remote_url, display_name, default_branch) VALUES (?, ?, ?)",
        )
        .bind(remote_url)
        .bind(display_name)
        .bind(default_branch)
        .execute(&self.pool)
        .await
        .context("creating repo")?
        .last_insert_rowid();

        self.get(id)
            .await?
            .context("repo missing right after insert")
    }

    /// Get a repo by ID.
    pub async fn get(&self, id: i64) -> Result<Option<Repo>> {
        let repo = sqlx::query_as::<_, Repo>(
            r#"
            SELECT id, remote_url, display_name, default_branch, last_used_at,
                   locked_by_task_id, locked_at, created_at
            FROM repos
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching repo")?;

        Ok(repo)
    }

    /// Get a repo by remote URL.
    pub async fn get_by_remote_url(&self, remote_url: &str) -> Result<Option<Repo>> {
        let repo = sqlx::query_as::<_, Repo>(
            r#"
            SELECT id, remote_url, display_name, default_branch, last_used_at,
                   locked_by_task_id, locked_at, created_at
            FROM repos
            WHERE remote_url = ?
            "#,
        )
        .bind(remote_url)
        .fetch_optional(&self.pool)
        .await
        .context("fetching repo by remote URL")?;

        Ok(repo)
    }

    /// List all repos.
    pub async fn list(&self) -> Result<Vec<Repo>> {
        let repos = sqlx::query_as::<_, Repo>(
            r#"
            SELECT id, remote_url, display_name, default_branch, last_used_at,
                   locked_by_task_id, locked_at, created_at
            FROM repos
            ORDER BY last_used_at DESC, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing repos")?;

        Ok(repos)
    }

    /// Mark the repo as used now.
    pub async fn touch_last_used(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE repos SET last_used_at = datetime('now') WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("touching repo last_used_at")?;
        Ok(())
    }

    /// Acquire the exclusive repo lock for a task.
    ///
    /// Reentrant: a task that already holds the lock acquires it again
    /// without error. Fails with [`LockError::LockedBy`] when another task
    /// holds it.
    pub async fn try_lock(&self, repo_id: i64, task_id: i64) -> Result<(), LockError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT locked_by_task_id FROM repos WHERE id = ?")
                .bind(repo_id)
                .fetch_optional(&mut *tx)
                .await?;

        match row {
            None => Err(LockError::RepoNotFound(repo_id)),
            Some((Some(holder),)) if holder != task_id => Err(LockError::LockedBy(holder)),
            Some((Some(_),)) => {
                // Already ours; reentrant acquisition.
                tx.commit().await?;
                Ok(())
            }
            Some((None,)) => {
                sqlx::query(
                    "UPDATE repos SET locked_by_task_id = ?, locked_at = datetime('now') WHERE id = ?",
                )
                .bind(task_id)
                .bind(repo_id)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(())
            }
        }
    }

    /// Release the lock if this task holds it. Compare-and-clear; idempotent.
    pub async fn unlock(&self, repo_id: i64, task_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE repos
            SET locked_by_task_id = NULL, locked_at = NULL
            WHERE id = ? AND locked_by_task_id = ?
            "#,
        )
        .bind(repo_id)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .context("releasing repo lock")?;

        Ok(())
    }

    /// Whether any task currently holds the lock.
    pub async fn is_locked(&self, repo_id: i64) -> Result<bool> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT locked_by_task_id FROM repos WHERE id = ?")
                .bind(repo_id)
                .fetch_optional(&self.pool)
                .await
                .context("checking repo lock")?;

        Ok(matches!(row, Some((Some(_),))))
    }

    /// Startup recovery sweep: release every lock whose holder is not in
    /// `live_task_ids`. Supervisors are gone after a restart, so locks left
    /// behind by a crash would otherwise wedge their repos forever.
    pub async fn release_stale_locks(&self, live_task_ids: &[i64]) -> Result<u64> {
        let locked: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT id, locked_by_task_id FROM repos WHERE locked_by_task_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing locked repos")?;

        let mut released = 0u64;
        for (repo_id, holder) in locked {
            if !live_task_ids.contains(&holder) {
                self.unlock(repo_id, holder).await?;
                info!(
                    "released stale lock on repo {} held by task {}",
                    repo_id, holder
                );
                released += 1;
            }
        }

        Ok(released)
    }
}
