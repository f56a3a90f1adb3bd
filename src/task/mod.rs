//! Tasks: the conversation unit of the platform.

mod models;
mod repository;

pub use models::{Task, TaskStatus};
pub use repository::TaskRepository;
