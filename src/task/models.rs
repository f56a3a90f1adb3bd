//! Task data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// An agent is actively working on the task.
    Active,
    /// The agent finished a turn and waits for the user.
    AwaitingInput,
    /// No live agent; the sandbox may hibernate.
    Idle,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Active => write!(f, "active"),
            TaskStatus::AwaitingInput => write!(f, "awaiting_input"),
            TaskStatus::Idle => write!(f, "idle"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(TaskStatus::Active),
            "awaiting_input" => Ok(TaskStatus::AwaitingInput),
            "idle" => Ok(TaskStatus::Idle),
            _ => Err(format!("unknown task status: {}", s)),
        }
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A task: one user conversation, optionally bound to a repository.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    /// Unique task ID.
    pub id: i64,
    /// Title, usually derived from the first user turn.
    pub title: Option<String>,
    /// Current status.
    #[sqlx(try_from = "String")]
    pub status: TaskStatus,
    /// Bound repository, if any.
    pub repo_id: Option<i64>,
    /// When the task was created.
    pub created_at: String,
    /// When the task was last touched.
    pub updated_at: String,
}
