//! Conversation store: append-only messages and execution sessions with a
//! bounded in-place mutation surface (streaming append, tool-result
//! back-patch).

use anyhow::{Context, Result, bail};
use serde_json::Value;
use sqlx::SqlitePool;

use super::models::{
    ExecutionSession, ExecutionSessionStatus, Message, MessageKind, NewMessage,
};

const MESSAGE_COLUMNS: &str =
    "id, task_id, execution_session_id, kind, content, tool_data, inserted_at";

const SESSION_COLUMNS: &str =
    "id, task_id, sandbox_name, kind, status, started_at, ended_at, metadata";

/// Store for conversation persistence.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    /// Create a new store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a message; returns its ID.
    ///
    /// Tool-call messages must carry `tool_data.tool_use_id`.
    pub async fn create_message(&self, message: NewMessage) -> Result<i64> {
        if message.kind == MessageKind::ToolCall {
            let has_id = message
                .tool_data
                .as_ref()
                .and_then(|d| d.get("tool_use_id"))
                .and_then(Value::as_str)
                .is_some();
            if !has_id {
                bail!("tool_call message requires tool_data.tool_use_id");
            }
        }

        let tool_data = message.tool_data.as_ref().map(Value::to_string);

        let id = sqlx::query(
            r#"
            INSERT INTO messages (task_id, execution_session_id, kind, content, tool_data)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.task_id)
        .bind(message.execution_session_id)
        .bind(message.kind.to_string())
        .bind(&message.content)
        .bind(tool_data)
        .execute(&self.pool)
        .await
        .context("creating message")?
        .last_insert_rowid();

        Ok(id)
    }

    /// Get a message by ID.
    pub async fn get_message(&self, id: i64) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching message")?;

        Ok(message)
    }

    /// Append text to an assistant message that is still streaming.
    ///
    /// Only valid for assistant messages whose execution session has not
    /// ended yet.
    pub async fn append_to_message(&self, id: i64, text: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET content = COALESCE(content, '') || ?
            WHERE id = ?
              AND kind = 'assistant'
              AND (
                execution_session_id IS NULL
                OR execution_session_id IN
                   (SELECT id FROM execution_sessions WHERE status = 'started')
              )
            "#,
        )
        .bind(text)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("appending to message")?;

        if result.rows_affected() == 0 {
            bail!("message {} is not an appendable assistant message", id);
        }
        Ok(())
    }

    /// Merge a tool result into a tool-call message's tool_data.
    pub async fn update_tool_result(&self, id: i64, output: &str, is_error: bool) -> Result<()> {
        let message = self
            .get_message(id)
            .await?
            .with_context(|| format!("message not found: {}", id))?;

        let mut tool_data = message
            .tool_data_value()
            .unwrap_or_else(|| Value::Object(Default::default()));
        if let Some(obj) = tool_data.as_object_mut() {
            obj.insert("output".to_string(), Value::String(output.to_string()));
            obj.insert("is_error".to_string(), Value::Bool(is_error));
        }

        sqlx::query("UPDATE messages SET tool_data = ? WHERE id = ?")
            .bind(tool_data.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating tool result")?;

        Ok(())
    }

    /// Find the tool-call message for a given tool_use_id, for back-patching
    /// its result.
    pub async fn find_tool_message(
        &self,
        task_id: i64,
        tool_use_id: &str,
    ) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE task_id = ?
              AND kind = 'tool_call'
              AND json_extract(tool_data, '$.tool_use_id') = ?
            ORDER BY id DESC
            LIMIT 1
            "#
        ))
        .bind(task_id)
        .bind(tool_use_id)
        .fetch_optional(&self.pool)
        .await
        .context("finding tool message")?;

        Ok(message)
    }

    /// List a task's messages in insertion order, bounded.
    pub async fn list_messages(&self, task_id: i64, limit: i64) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE task_id = ? ORDER BY id ASC LIMIT ?"
        ))
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing messages")?;

        Ok(messages)
    }

    /// Start an execution session for a task.
    ///
    /// The caller holds the obligation to eventually terminate it. At most
    /// one started session may exist per task.
    pub async fn start_execution_session(
        &self,
        task_id: i64,
        sandbox_name: &str,
        kind: &str,
    ) -> Result<ExecutionSession> {
        if let Some(open) = self.started_execution_session(task_id).await? {
            bail!(
                "task {} already has started execution session {}",
                task_id,
                open.id
            );
        }

        let id = sqlx::query(
            "INSERT INTO execution_sessions (task_id, sandbox_name, kind) VALUES (?, ?, ?)",
        )
        .bind(task_id)
        .bind(sandbox_name)
        .bind(kind)
        .execute(&self.pool)
        .await
        .context("starting execution session")?
        .last_insert_rowid();

        self.get_execution_session(id)
            .await?
            .context("execution session missing right after insert")
    }

    /// Get an execution session by ID.
    pub async fn get_execution_session(&self, id: i64) -> Result<Option<ExecutionSession>> {
        let session = sqlx::query_as::<_, ExecutionSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM execution_sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching execution session")?;

        Ok(session)
    }

    /// The task's currently-started execution session, if any.
    pub async fn started_execution_session(
        &self,
        task_id: i64,
    ) -> Result<Option<ExecutionSession>> {
        let session = sqlx::query_as::<_, ExecutionSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM execution_sessions WHERE task_id = ? AND status = 'started'"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching started execution session")?;

        Ok(session)
    }

    /// Terminate an execution session. Idempotent: a session already in a
    /// terminal status keeps its original status and `ended_at`.
    pub async fn complete_execution_session(
        &self,
        id: i64,
        status: ExecutionSessionStatus,
    ) -> Result<()> {
        if !status.is_terminal() {
            bail!("cannot complete execution session {} with status started", id);
        }

        sqlx::query(
            r#"
            UPDATE execution_sessions
            SET status = ?, ended_at = datetime('now')
            WHERE id = ? AND status = 'started'
            "#,
        )
        .bind(status.to_string())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("completing execution session")?;

        Ok(())
    }

    /// Startup recovery: close every started execution session as
    /// interrupted. After a restart no supervisor owns these rows.
    pub async fn interrupt_all_started(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE execution_sessions
            SET status = 'interrupted', ended_at = datetime('now')
            WHERE status = 'started'
            "#,
        )
        .execute(&self.pool)
        .await
        .context("interrupting started execution sessions")?;

        Ok(result.rows_affected())
    }

    /// List a task's execution sessions in start order, bounded.
    pub async fn list_execution_sessions(
        &self,
        task_id: i64,
        limit: i64,
    ) -> Result<Vec<ExecutionSession>> {
        let sessions = sqlx::query_as::<_, ExecutionSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM execution_sessions WHERE task_id = ? ORDER BY id ASC LIMIT ?"
        ))
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing execution sessions")?;

        Ok(sessions)
    }
}
