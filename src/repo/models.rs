//! Repo data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered source repository.
///
/// `locked_by_task_id` is non-null exactly while some task holds the
/// exclusive lock; at most one task holds it at any moment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Repo {
    /// Unique repo ID.
    pub id: i64,
    /// Git remote URL (unique).
    pub remote_url: String,
    /// Display name in `owner/repo` form (unique).
    pub display_name: String,
    /// Default branch.
    pub default_branch: String,
    /// When a task last used this repo.
    pub last_used_at: Option<String>,
    /// Task currently holding the exclusive lock.
    pub locked_by_task_id: Option<i64>,
    /// When the lock was acquired.
    pub locked_at: Option<String>,
    /// When the repo was first registered.
    pub created_at: String,
}

impl Repo {
    /// Deterministic working directory inside the sprite.
    pub fn working_dir(&self) -> String {
        format!("/home/sprite/repos/{}", self.display_name)
    }
}
