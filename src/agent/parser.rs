//! Stream-json line parser.
//!
//! Each stdout line is one JSON record whose `type` field selects the event.
//! Malformed lines never abort the stream; the caller surfaces them as raw
//! output instead.

use std::collections::HashSet;

use serde_json::{Map, Value, json};

use super::events::{AgentEvent, ToolUse};

/// How many entries of a file/match list to render before truncating.
const LIST_PREVIEW_LIMIT: usize = 10;

/// Serialize a user turn as one stream-json input line (trailing newline
/// included), ready to be written to the agent as a single frame.
pub fn encode_user_turn(text: &str) -> String {
    let record = json!({
        "type": "user",
        "message": { "role": "user", "content": text },
    });
    let mut line = record.to_string();
    line.push('\n');
    line
}

/// Parse one stdout line into a typed event.
///
/// Returns `None` for lines that are not valid JSON records; the caller is
/// expected to emit those as raw output.
pub fn parse_line(line: &str) -> Option<AgentEvent> {
    let record: Value = serde_json::from_str(line.trim()).ok()?;
    let kind = record.get("type")?.as_str()?.to_string();

    let event = match kind.as_str() {
        "system" | "system_init" => AgentEvent::SystemInit {
            data: record.clone(),
        },
        "assistant" => parse_assistant(&record),
        "user" => match extract_tool_result(&record) {
            Some(event) => event,
            None => AgentEvent::Other {
                kind: kind.clone(),
                data: record,
            },
        },
        "message_stop" => AgentEvent::MessageStop,
        _ => AgentEvent::Other {
            kind: kind.clone(),
            data: record,
        },
    };

    Some(event)
}

/// Assemble a model turn: text segments concatenated in content order, tool
/// invocations preserved in content order.
fn parse_assistant(record: &Value) -> AgentEvent {
    let content = record
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array);

    let mut text = String::new();
    let mut tool_uses = Vec::new();

    if let Some(entries) = content {
        for entry in entries {
            match entry.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = entry.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    tool_uses.push(ToolUse {
                        id: entry
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: entry
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        input: entry.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }
    }

    AgentEvent::AssistantMessage { text, tool_uses }
}

/// Extract a tool result from a "user" record carrying `tool_use_result`.
///
/// The matching `tool_use_id` comes from the first entry of the message
/// content array; the payload itself takes many shapes (see
/// [`render_tool_payload`]).
fn extract_tool_result(record: &Value) -> Option<AgentEvent> {
    let payload = record.get("tool_use_result")?;
    let tool_use_id = record
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())
        .and_then(|entry| entry.get("tool_use_id"))
        .and_then(Value::as_str)?
        .to_string();

    let (stdout, stderr, is_error) = render_tool_payload(payload);

    Some(AgentEvent::ToolResult {
        tool_use_id,
        stdout,
        stderr,
        is_error,
    })
}

/// Normalize a tool result payload to (stdout, stderr, is_error).
///
/// First matching shape wins; an unrecognized map falls back to compact JSON
/// with the `isError` and `type` keys stripped.
fn render_tool_payload(payload: &Value) -> (String, String, bool) {
    if let Some(s) = payload.as_str() {
        return (s.to_string(), String::new(), false);
    }

    let Some(obj) = payload.as_object() else {
        return (payload.to_string(), String::new(), false);
    };

    let is_error = obj
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if obj.contains_key("stdout") {
        let stdout = value_as_text(obj.get("stdout").unwrap_or(&Value::Null));
        let stderr = obj
            .get("stderr")
            .map(value_as_text)
            .unwrap_or_default();
        return (stdout, stderr, is_error);
    }

    if let Some(content) = obj.get("file").and_then(|f| f.get("content")) {
        return (value_as_text(content), String::new(), is_error);
    }

    if let Some(new_todos) = obj.get("newTodos").and_then(Value::as_array) {
        let old_todos = obj
            .get("oldTodos")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        return (todo_diff(&old_todos, new_todos), String::new(), is_error);
    }

    if let Some(files) = obj.get("files").and_then(Value::as_array) {
        return (truncated_list(files), String::new(), is_error);
    }

    if let Some(matches) = obj.get("matches").and_then(Value::as_array) {
        let formatted: Vec<Value> = matches
            .iter()
            .map(|m| Value::String(format_match(m)))
            .collect();
        return (truncated_list(&formatted), String::new(), is_error);
    }

    for key in ["content", "output", "result", "text"] {
        if let Some(value) = obj.get(key) {
            return (value_as_text(value), String::new(), is_error);
        }
    }

    let mut stripped: Map<String, Value> = obj.clone();
    stripped.remove("isError");
    stripped.remove("type");
    (Value::Object(stripped).to_string(), String::new(), is_error)
}

/// Render a value as plain text: strings verbatim, arrays of text blocks
/// concatenated, anything else as compact JSON.
fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .map(|block| match block {
                Value::String(s) => s.clone(),
                other => other
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            })
            .collect::<Vec<_>>()
            .join(""),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Join the first entries of a list, noting how many were cut.
fn truncated_list(entries: &[Value]) -> String {
    let shown: Vec<String> = entries
        .iter()
        .take(LIST_PREVIEW_LIMIT)
        .map(|e| match e {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();

    let mut out = shown.join("\n");
    if entries.len() > LIST_PREVIEW_LIMIT {
        out.push_str(&format!(
            "\n… and {} more",
            entries.len() - LIST_PREVIEW_LIMIT
        ));
    }
    out
}

fn format_match(m: &Value) -> String {
    if let Some(s) = m.as_str() {
        return s.to_string();
    }
    if let Some(obj) = m.as_object() {
        let path = obj
            .get("file")
            .or_else(|| obj.get("path"))
            .and_then(Value::as_str);
        if let Some(path) = path {
            let line = obj
                .get("line")
                .or_else(|| obj.get("line_number"))
                .and_then(Value::as_i64);
            return match line {
                Some(n) => format!("{path}:{n}"),
                None => path.to_string(),
            };
        }
    }
    m.to_string()
}

/// Render a human-readable diff between two todo lists: `+` for new items,
/// `✓` completed, `→` in progress, `○` pending.
fn todo_diff(old_todos: &[Value], new_todos: &[Value]) -> String {
    let known: HashSet<String> = old_todos.iter().filter_map(todo_key).collect();

    new_todos
        .iter()
        .map(|todo| {
            let label = todo
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| todo.to_string());
            let is_new = todo_key(todo).map(|k| !known.contains(&k)).unwrap_or(true);
            let marker = if is_new {
                "+"
            } else {
                match todo.get("status").and_then(Value::as_str) {
                    Some("completed") => "✓",
                    Some("in_progress") => "→",
                    _ => "○",
                }
            };
            format!("{marker} {label}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn todo_key(todo: &Value) -> Option<String> {
    todo.get("id")
        .or_else(|| todo.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
