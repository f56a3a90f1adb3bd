//! Events published to session subscribers.

use serde::Serialize;
use serde_json::Value;

use crate::convo::ExecutionSessionStatus;

/// The status stream visible to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishedStatus {
    Connecting,
    StartingAgent,
    Ready,
    Processing,
    Disconnected,
    Idle,
    Error,
}

/// Events sent to UI subscribers of a session.
///
/// Within one execution session these preserve the agent's emit order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Session status transition.
    Status { status: PublishedStatus },

    /// A model turn's text, persisted as `message_id`.
    AgentText { message_id: i64, text: String },

    /// A tool invocation, persisted as `message_id`.
    ToolUse {
        message_id: i64,
        tool_use_id: String,
        name: String,
        input: Value,
    },

    /// A tool result back-patched onto its call record.
    ToolResult {
        tool_use_id: String,
        output: String,
        is_error: bool,
    },

    /// The agent finished a turn.
    AgentDone,

    /// An error surfaced to the user.
    AgentError { message: String },

    /// A new execution session opened.
    ExecutionSessionStarted { execution_session_id: i64 },

    /// An execution session closed.
    ExecutionSessionEnded {
        execution_session_id: i64,
        status: ExecutionSessionStatus,
    },

    /// Agent output that was not a structured event.
    RawOutput { text: String },
}
