//! The allocator: process-wide coordinator for sandbox allocations and repo
//! locks, with a prewarm pipeline.
//!
//! One actor owns all mutable allocation state; public calls are message
//! sends. Setup work (sprite creation, git configuration, clone/pull) runs
//! in spawned tasks so the actor stays responsive; results flow back as
//! completion messages.

mod actor;
mod setup;

pub use actor::{Allocator, AllocatorHandle};

use std::time::Duration;

use thiserror::Error;

use crate::repo::Repo;

/// Allocator configuration.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Name of the shared sandbox all tasks route to.
    pub sandbox_name: String,
    /// GitHub token for private clones, if configured.
    pub github_token: Option<String>,
    /// Whether created sprites get public URLs.
    pub public_sandbox: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            sandbox_name: "spritedock-default".to_string(),
            github_token: None,
            public_sandbox: false,
        }
    }
}

/// Outer deadline for a synchronous allocate call.
pub const ALLOCATE_TIMEOUT: Duration = Duration::from_secs(120);

/// A successful allocation: where the agent runs and where it works.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub sandbox_name: String,
    pub working_dir: String,
}

/// What the allocator needs to know about a task.
#[derive(Debug, Clone)]
pub struct AllocRequest {
    pub task_id: i64,
    /// The task's repo, preloaded by the caller.
    pub repo: Option<Repo>,
}

/// Typed allocation failures, surfaced to observers as reasons.
#[derive(Debug, Clone, Error)]
pub enum AllocError {
    /// Another task holds the repo lock. Surfaced to the user; not retried.
    #[error("repository in use by task {0}")]
    RepoLocked(i64),

    /// The sandbox could not be created.
    #[error("sandbox creation failed: {0}")]
    SandboxCreationFailed(String),

    /// Git global configuration could not be written.
    #[error("git configuration failed: {0}")]
    GitConfigFailed(String),

    /// The clone did not complete.
    #[error("clone failed: {0}")]
    CloneFailed(String),

    /// The repo row disappeared.
    #[error("repo not found: {0}")]
    RepoNotFound(i64),

    /// A prewarm failed before any waiter arrived.
    #[error("prewarm failed: {0}")]
    PrewarmFailed(String),

    /// The allocate call exceeded its outer deadline.
    #[error("allocation timed out")]
    Timeout,

    /// The allocator actor is gone.
    #[error("allocator unavailable")]
    Unavailable,

    /// Unexpected internal failure (database, channel).
    #[error("internal allocator error: {0}")]
    Internal(String),
}
