//! Typed event sum decoded from the agent's output stream.

use serde_json::Value;

/// One tool invocation requested by a model turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// A parsed agent event.
///
/// Downstream consumers dispatch on the variant; anything the parser does not
/// recognize stays available as [`AgentEvent::Other`] with its raw payload.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// Opaque initialization info emitted when the agent boots.
    SystemInit { data: Value },

    /// One model turn: concatenated text plus tool invocations in content order.
    AssistantMessage {
        text: String,
        tool_uses: Vec<ToolUse>,
    },

    /// Result of a tool invocation, normalized to stdout/stderr text.
    ToolResult {
        tool_use_id: String,
        stdout: String,
        stderr: String,
        is_error: bool,
    },

    /// End of one agent turn.
    MessageStop,

    /// Any other named record type, passed through opaquely.
    Other { kind: String, data: Value },
}
