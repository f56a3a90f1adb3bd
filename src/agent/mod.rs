//! Agent stream protocol: typed events and the stream-json line parser.
//!
//! The inner agent speaks newline-delimited JSON over its stdio; the channel
//! feeds assembled lines through [`parse_line`] and forwards the typed events
//! to the session supervisor.

mod events;
mod parser;

pub use events::{AgentEvent, ToolUse};
pub use parser::{encode_user_turn, parse_line};
