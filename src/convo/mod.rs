//! Conversation persistence: messages and execution sessions.

mod models;
mod repository;

pub use models::{ExecutionSession, ExecutionSessionStatus, Message, MessageKind, NewMessage};
pub use repository::ConversationStore;
