//! Conversation data models.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    System,
    ToolCall,
    Error,
    SessionStart,
    SessionEnd,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::User => write!(f, "user"),
            MessageKind::Assistant => write!(f, "assistant"),
            MessageKind::System => write!(f, "system"),
            MessageKind::ToolCall => write!(f, "tool_call"),
            MessageKind::Error => write!(f, "error"),
            MessageKind::SessionStart => write!(f, "session_start"),
            MessageKind::SessionEnd => write!(f, "session_end"),
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageKind::User),
            "assistant" => Ok(MessageKind::Assistant),
            "system" => Ok(MessageKind::System),
            "tool_call" => Ok(MessageKind::ToolCall),
            "error" => Ok(MessageKind::Error),
            "session_start" => Ok(MessageKind::SessionStart),
            "session_end" => Ok(MessageKind::SessionEnd),
            _ => Err(format!("unknown message kind: {}", s)),
        }
    }
}

impl TryFrom<String> for MessageKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        value.parse()
    }
}

/// A persisted conversation entry.
///
/// Append-only for kind, tool_use_id and session membership; `content` and
/// `tool_data.output` may still be mutated (streaming append, tool-result
/// back-patch) while the owning execution session is running.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    /// Unique message ID.
    pub id: i64,
    /// Owning task.
    pub task_id: i64,
    /// Execution session this message belongs to, if any.
    pub execution_session_id: Option<i64>,
    /// Message kind.
    #[sqlx(try_from = "String")]
    pub kind: MessageKind,
    /// Text content.
    pub content: Option<String>,
    /// Opaque tool data as a JSON document.
    pub tool_data: Option<String>,
    /// Insertion timestamp.
    pub inserted_at: String,
}

impl Message {
    /// Parsed tool data, if present and valid JSON.
    pub fn tool_data_value(&self) -> Option<Value> {
        self.tool_data
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Parameters for inserting a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub task_id: i64,
    pub execution_session_id: Option<i64>,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub tool_data: Option<Value>,
}

/// Execution session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionSessionStatus {
    Started,
    Completed,
    Failed,
    Interrupted,
}

impl ExecutionSessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionSessionStatus::Started)
    }
}

impl std::fmt::Display for ExecutionSessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionSessionStatus::Started => write!(f, "started"),
            ExecutionSessionStatus::Completed => write!(f, "completed"),
            ExecutionSessionStatus::Failed => write!(f, "failed"),
            ExecutionSessionStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::str::FromStr for ExecutionSessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(ExecutionSessionStatus::Started),
            "completed" => Ok(ExecutionSessionStatus::Completed),
            "failed" => Ok(ExecutionSessionStatus::Failed),
            "interrupted" => Ok(ExecutionSessionStatus::Interrupted),
            _ => Err(format!("unknown execution session status: {}", s)),
        }
    }
}

impl TryFrom<String> for ExecutionSessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One contiguous span of agent context for a task.
///
/// While `status = started`, at most one row exists per task; `ended_at` is
/// null exactly while started and never mutates again after termination.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionSession {
    /// Unique execution session ID.
    pub id: i64,
    /// Owning task.
    pub task_id: i64,
    /// Sandbox the agent ran in.
    pub sandbox_name: String,
    /// Session kind, "agent" by default.
    pub kind: String,
    /// Current status.
    #[sqlx(try_from = "String")]
    pub status: ExecutionSessionStatus,
    /// When the session started.
    pub started_at: String,
    /// When the session ended; null while started.
    pub ended_at: Option<String>,
    /// Opaque metadata as a JSON document.
    pub metadata: Option<String>,
}
