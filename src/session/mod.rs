//! Per-task session supervision.
//!
//! One supervisor actor per active task, registered by task ID; the UI
//! attaches to the existing supervisor rather than starting another.

mod events;
mod registry;
mod supervisor;

pub use events::{PublishedStatus, SessionEvent};
pub use registry::SessionRegistry;
pub use supervisor::{SessionConfig, SessionDeps, SessionHandle, SessionSupervisor};
