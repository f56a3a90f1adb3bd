//! The session supervisor: per-task state machine.
//!
//! Routes user turns into the agent channel, relays agent events to
//! subscribers, persists the derived conversation, and enforces the idle
//! timeout that lets the sandbox hibernate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::agent::AgentEvent;
use crate::allocator::{ALLOCATE_TIMEOUT, AllocError, AllocRequest, AllocatorHandle};
use crate::channel::{AgentChannel, ChannelConfig, ChannelEvent, ChannelHandle};
use crate::convo::{ConversationStore, ExecutionSessionStatus, MessageKind, NewMessage};
use crate::repo::{Repo, RepoRepository};
use crate::sprite::SpriteApi;
use crate::task::{Task, TaskRepository, TaskStatus};
use crate::token::TokenManager;

use super::events::{PublishedStatus, SessionEvent};
use super::registry::SessionRegistry;

/// Mailbox depth for supervisor commands.
const COMMAND_BUFFER_SIZE: usize = 64;

/// Buffer for events fanned out to subscribers.
const EVENT_BUFFER_SIZE: usize = 256;

/// Buffer for events arriving from the channel.
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Max characters of the first user turn used as a task title.
const TITLE_MAX_CHARS: usize = 80;

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period after a turn before the channel is torn down.
    pub idle_timeout: Duration,
    /// GitHub token forwarded into the agent environment.
    pub github_token: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(2 * 60),
            github_token: None,
        }
    }
}

/// Everything a supervisor needs from the rest of the system.
#[derive(Clone)]
pub struct SessionDeps {
    pub allocator: AllocatorHandle,
    pub sprites: Arc<dyn SpriteApi>,
    pub tokens: Arc<TokenManager>,
    pub store: ConversationStore,
    pub tasks: TaskRepository,
    pub repos: RepoRepository,
    pub config: SessionConfig,
}

/// Commands from clients attached to the session.
#[derive(Debug)]
enum SessionCommand {
    SendMessage(String),
    Interrupt,
    Terminate,
}

/// Handle to a live supervisor.
#[derive(Clone)]
pub struct SessionHandle {
    pub task_id: i64,
    cmd_tx: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Subscribe to the session's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Route a user turn into the session. Never silently discarded: it is
    /// sent immediately, queued for later delivery, or surfaced as an error
    /// event.
    pub async fn send_message(&self, text: impl Into<String>) -> bool {
        self.cmd_tx
            .send(SessionCommand::SendMessage(text.into()))
            .await
            .is_ok()
    }

    /// Interrupt the agent mid-turn.
    pub async fn interrupt(&self) -> bool {
        self.cmd_tx.send(SessionCommand::Interrupt).await.is_ok()
    }

    /// Tear the session down, releasing its allocation.
    pub async fn terminate(&self) -> bool {
        self.cmd_tx.send(SessionCommand::Terminate).await.is_ok()
    }
}

/// Internal supervisor status. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisorStatus {
    Initializing,
    Connecting,
    Ready,
    Processing,
    Idle,
    Disconnected,
    Exited,
    Error,
    Stopped,
}

/// Removes the registry entry when the supervisor exits, on every path.
struct RegistryGuard {
    registry: Arc<SessionRegistry>,
    task_id: i64,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.remove(self.task_id);
    }
}

enum Input {
    Command(Option<SessionCommand>),
    Channel(Option<ChannelEvent>),
    IdleTimeout,
}

/// The per-task supervisor actor.
pub struct SessionSupervisor {
    task: Task,
    repo: Option<Repo>,
    deps: SessionDeps,

    status: SupervisorStatus,
    sandbox_name: Option<String>,
    working_dir: Option<String>,
    channel: Option<ChannelHandle>,
    chan_rx: Option<mpsc::Receiver<ChannelEvent>>,
    execution_session_id: Option<i64>,
    queue: VecDeque<String>,
    idle_deadline: Option<Instant>,

    events: broadcast::Sender<SessionEvent>,
}

impl SessionSupervisor {
    /// Open a session for a task: attach to the live supervisor if one
    /// exists, otherwise register and spawn a new one. Initialization runs
    /// asynchronously after registration.
    pub async fn open(
        registry: Arc<SessionRegistry>,
        deps: SessionDeps,
        task: Task,
    ) -> Result<SessionHandle> {
        if let Some(handle) = registry.get(task.id) {
            debug!("attaching to existing supervisor for task {}", task.id);
            return Ok(handle);
        }

        let repo = match task.repo_id {
            Some(repo_id) => deps.repos.get(repo_id).await?,
            None => None,
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);

        let handle = SessionHandle {
            task_id: task.id,
            cmd_tx,
            events: events.clone(),
        };
        registry.insert(task.id, handle.clone());

        let supervisor = Self {
            task,
            repo,
            deps,
            status: SupervisorStatus::Initializing,
            sandbox_name: None,
            working_dir: None,
            channel: None,
            chan_rx: None,
            execution_session_id: None,
            queue: VecDeque::new(),
            idle_deadline: None,
            events,
        };

        tokio::spawn(supervisor.run(registry, cmd_rx));

        Ok(handle)
    }

    async fn run(
        mut self,
        registry: Arc<SessionRegistry>,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
    ) {
        let _guard = RegistryGuard {
            registry,
            task_id: self.task.id,
        };

        info!("supervisor for task {} starting", self.task.id);
        self.initialize().await;

        while self.status != SupervisorStatus::Stopped {
            let idle_deadline = self.idle_deadline;

            let input = tokio::select! {
                cmd = cmd_rx.recv() => Input::Command(cmd),
                event = Self::recv_channel(&mut self.chan_rx) => Input::Channel(event),
                _ = Self::sleep_until_deadline(idle_deadline), if idle_deadline.is_some() => {
                    Input::IdleTimeout
                }
            };

            match input {
                Input::Command(Some(cmd)) => self.handle_command(cmd).await,
                Input::Command(None) => break,
                Input::Channel(Some(event)) => self.handle_channel_event(event).await,
                Input::Channel(None) => {
                    // Channel actor finished; stop polling its mailbox.
                    self.chan_rx = None;
                    self.channel = None;
                }
                Input::IdleTimeout => self.handle_idle_timeout().await,
            }
        }

        info!("supervisor for task {} stopped", self.task.id);
    }

    async fn recv_channel(rx: &mut Option<mpsc::Receiver<ChannelEvent>>) -> Option<ChannelEvent> {
        match rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn sleep_until_deadline(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    // ========== Initialization ==========

    async fn initialize(&mut self) {
        self.status = SupervisorStatus::Connecting;
        self.publish_status(PublishedStatus::Connecting);

        let request = AllocRequest {
            task_id: self.task.id,
            repo: self.repo.clone(),
        };

        let allocation =
            match tokio::time::timeout(ALLOCATE_TIMEOUT, self.deps.allocator.allocate(request))
                .await
            {
                Err(_) => {
                    // The lock must not outlive a timed-out allocation.
                    self.deps.allocator.release(self.task.id).await;
                    Err(AllocError::Timeout)
                }
                Ok(result) => result,
            };

        match allocation {
            Ok(allocation) => {
                self.mark_task(TaskStatus::Active).await;
                self.sandbox_name = Some(allocation.sandbox_name);
                self.working_dir = Some(allocation.working_dir);
                self.publish_status(PublishedStatus::StartingAgent);
                self.start_channel().await;
            }
            Err(AllocError::RepoLocked(other)) => {
                self.fail_with_error(format!("Repository in use by another task (task {other})"))
                    .await;
            }
            Err(err) => {
                error!("allocation for task {} failed: {}", self.task.id, err);
                self.fail_with_error("Failed to prepare sandbox".to_string())
                    .await;
            }
        }
    }

    /// Spawn a fresh agent channel against the allocated sandbox.
    async fn start_channel(&mut self) {
        let (Some(sandbox_name), Some(working_dir)) =
            (self.sandbox_name.clone(), self.working_dir.clone())
        else {
            warn!("start_channel without an allocation for task {}", self.task.id);
            self.enter_error();
            return;
        };

        let oauth_token = match self.deps.tokens.get_access_token().await {
            Ok(token) => token,
            Err(e) => {
                error!("no agent token for task {}: {}", self.task.id, e);
                self.fail_with_error(format!("Agent token unavailable: {e}"))
                    .await;
                return;
            }
        };

        let config = ChannelConfig {
            sandbox_name,
            working_dir,
            repo_display_name: self.repo.as_ref().map(|r| r.display_name.clone()),
            oauth_token,
            github_token: self.deps.config.github_token.clone(),
        };

        let (chan_tx, chan_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let handle = AgentChannel::spawn(self.deps.sprites.clone(), config, chan_tx);
        self.channel = Some(handle);
        self.chan_rx = Some(chan_rx);
        self.status = SupervisorStatus::Connecting;
    }

    // ========== Commands ==========

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::SendMessage(text) => self.handle_send_message(text).await,
            SessionCommand::Interrupt => {
                if let Some(channel) = &self.channel {
                    channel.interrupt().await;
                }
            }
            SessionCommand::Terminate => self.handle_terminate().await,
        }
    }

    async fn handle_send_message(&mut self, text: String) {
        self.idle_deadline = None;

        match self.status {
            SupervisorStatus::Ready => {
                self.deliver_turn(text).await;
            }
            SupervisorStatus::Processing => {
                self.queue.push_back(text);
            }
            SupervisorStatus::Disconnected
            | SupervisorStatus::Exited
            | SupervisorStatus::Idle => {
                // Wake the sandbox: queue the turn and bring a channel back.
                // A disconnected channel is already reconnecting on its own;
                // only spawn a fresh one when the old one is gone.
                self.queue.push_back(text);
                self.publish_status(PublishedStatus::Connecting);
                self.status = SupervisorStatus::Connecting;
                if self.channel.is_none() {
                    self.start_channel().await;
                }
            }
            _ => {
                self.queue.push_back(text);
            }
        }
    }

    /// Send one user turn down the channel, persisting it first.
    async fn deliver_turn(&mut self, text: String) {
        // A fresh turn is about to run; the quiet-period timer armed by
        // message_stop must not fire mid-turn.
        self.idle_deadline = None;

        let Some(channel) = self.channel.clone() else {
            self.queue.push_front(text);
            return;
        };

        if let Err(e) = self
            .deps
            .tasks
            .set_title_if_empty(self.task.id, &derive_title(&text))
            .await
        {
            warn!("failed to set title for task {}: {:?}", self.task.id, e);
        }

        self.persist(NewMessage {
            task_id: self.task.id,
            execution_session_id: self.execution_session_id,
            kind: MessageKind::User,
            content: Some(text.clone()),
            tool_data: None,
        })
        .await;

        if !channel.send_user_turn(text.clone()).await {
            // Channel died under us; keep the turn for the restart.
            self.queue.push_front(text);
            return;
        }

        self.mark_task(TaskStatus::Active).await;
        self.status = SupervisorStatus::Processing;
        self.publish_status(PublishedStatus::Processing);
    }

    async fn handle_terminate(&mut self) {
        self.close_execution_session(ExecutionSessionStatus::Interrupted)
            .await;
        if let Some(channel) = self.channel.take() {
            channel.shutdown("session terminated").await;
        }
        self.deps.allocator.release(self.task.id).await;
        self.mark_task(TaskStatus::Idle).await;
        self.publish_status(PublishedStatus::Idle);
        self.status = SupervisorStatus::Stopped;
    }

    // ========== Channel events ==========

    async fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Ready => self.on_channel_ready().await,
            ChannelEvent::Event(event) => self.on_agent_event(event).await,
            ChannelEvent::RawOutput(text) => {
                self.publish(SessionEvent::RawOutput { text });
            }
            ChannelEvent::Stderr(text) => {
                debug!("agent stderr for task {}: {}", self.task.id, text.trim_end());
            }
            ChannelEvent::Exited { code } => self.on_agent_exit(code).await,
            ChannelEvent::Disconnected { fatal, reason } => {
                self.on_disconnect(fatal, reason).await;
            }
            ChannelEvent::Terminated { reason } => {
                debug!("channel for task {} terminated: {}", self.task.id, reason);
                self.channel = None;
                self.chan_rx = None;
            }
        }
    }

    async fn on_channel_ready(&mut self) {
        let sandbox_name = self
            .sandbox_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string());

        // Reconnects open a new agent run; never leave two sessions started.
        self.close_execution_session(ExecutionSessionStatus::Interrupted)
            .await;

        // A session left open by a previous supervisor (crash, fatal
        // disconnect) is stale by now.
        match self.deps.store.started_execution_session(self.task.id).await {
            Ok(Some(stale)) => {
                if let Err(e) = self
                    .deps
                    .store
                    .complete_execution_session(stale.id, ExecutionSessionStatus::Interrupted)
                    .await
                {
                    warn!("failed to close stale execution session {}: {:?}", stale.id, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("stale execution session lookup failed: {:?}", e),
        }

        match self
            .deps
            .store
            .start_execution_session(self.task.id, &sandbox_name, "agent")
            .await
        {
            Ok(session) => {
                self.execution_session_id = Some(session.id);
                self.persist(NewMessage {
                    task_id: self.task.id,
                    execution_session_id: Some(session.id),
                    kind: MessageKind::SessionStart,
                    content: None,
                    tool_data: Some(json!({ "sandbox_name": sandbox_name })),
                })
                .await;
                self.publish(SessionEvent::ExecutionSessionStarted {
                    execution_session_id: session.id,
                });
            }
            Err(e) => {
                error!(
                    "failed to start execution session for task {}: {:?}",
                    self.task.id, e
                );
            }
        }

        self.status = SupervisorStatus::Ready;
        self.publish_status(PublishedStatus::Ready);
        self.drain_one().await;
    }

    async fn on_agent_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::SystemInit { data } => {
                self.persist(NewMessage {
                    task_id: self.task.id,
                    execution_session_id: self.execution_session_id,
                    kind: MessageKind::System,
                    content: None,
                    tool_data: Some(data),
                })
                .await;
            }
            AgentEvent::AssistantMessage { text, tool_uses } => {
                if !text.is_empty() {
                    if let Some(message_id) = self
                        .persist(NewMessage {
                            task_id: self.task.id,
                            execution_session_id: self.execution_session_id,
                            kind: MessageKind::Assistant,
                            content: Some(text.clone()),
                            tool_data: None,
                        })
                        .await
                    {
                        self.publish(SessionEvent::AgentText { message_id, text });
                    }
                }

                for tool_use in tool_uses {
                    let tool_data = json!({
                        "tool_use_id": tool_use.id.clone(),
                        "tool_name": tool_use.name.clone(),
                        "input": tool_use.input.clone(),
                    });
                    if let Some(message_id) = self
                        .persist(NewMessage {
                            task_id: self.task.id,
                            execution_session_id: self.execution_session_id,
                            kind: MessageKind::ToolCall,
                            content: None,
                            tool_data: Some(tool_data),
                        })
                        .await
                    {
                        self.publish(SessionEvent::ToolUse {
                            message_id,
                            tool_use_id: tool_use.id,
                            name: tool_use.name,
                            input: tool_use.input,
                        });
                    }
                }
            }
            AgentEvent::ToolResult {
                tool_use_id,
                stdout,
                stderr,
                is_error,
            } => {
                let output = if stderr.is_empty() {
                    stdout
                } else if stdout.is_empty() {
                    stderr
                } else {
                    format!("{stdout}\n{stderr}")
                };
                self.backpatch_tool_result(&tool_use_id, &output, is_error)
                    .await;
                self.publish(SessionEvent::ToolResult {
                    tool_use_id,
                    output,
                    is_error,
                });
            }
            AgentEvent::MessageStop => self.on_message_stop().await,
            AgentEvent::Other { kind, data } => {
                debug!(
                    "opaque agent event '{}' for task {}: {}",
                    kind, self.task.id, data
                );
            }
        }
    }

    async fn backpatch_tool_result(&mut self, tool_use_id: &str, output: &str, is_error: bool) {
        match self
            .deps
            .store
            .find_tool_message(self.task.id, tool_use_id)
            .await
        {
            Ok(Some(message)) => {
                if let Err(e) = self
                    .deps
                    .store
                    .update_tool_result(message.id, output, is_error)
                    .await
                {
                    warn!("failed to back-patch tool result {}: {:?}", tool_use_id, e);
                }
            }
            Ok(None) => {
                warn!(
                    "tool result {} for task {} has no matching call",
                    tool_use_id, self.task.id
                );
            }
            Err(e) => warn!("tool message lookup failed: {:?}", e),
        }
    }

    async fn on_message_stop(&mut self) {
        self.publish(SessionEvent::AgentDone);
        self.status = SupervisorStatus::Ready;
        self.publish_status(PublishedStatus::Ready);
        self.mark_task(TaskStatus::AwaitingInput).await;
        self.idle_deadline = Some(Instant::now() + self.deps.config.idle_timeout);
        self.drain_one().await;
    }

    async fn on_agent_exit(&mut self, code: i32) {
        info!("agent for task {} exited with code {}", self.task.id, code);
        let status = if code == 0 {
            ExecutionSessionStatus::Completed
        } else {
            ExecutionSessionStatus::Failed
        };
        self.close_execution_session(status).await;
        self.status = SupervisorStatus::Exited;
        self.publish_status(PublishedStatus::Ready);
        self.mark_task(TaskStatus::AwaitingInput).await;
    }

    async fn on_disconnect(&mut self, fatal: bool, reason: String) {
        warn!(
            "channel for task {} disconnected (fatal={}): {}",
            self.task.id, fatal, reason
        );
        self.close_execution_session(ExecutionSessionStatus::Interrupted)
            .await;

        if fatal {
            // The sandbox is gone; stop and let the owner recreate us.
            self.channel = None;
            self.chan_rx = None;
            self.status = SupervisorStatus::Stopped;
        } else {
            self.status = SupervisorStatus::Disconnected;
            self.publish_status(PublishedStatus::Disconnected);
        }
    }

    async fn handle_idle_timeout(&mut self) {
        info!("task {} idle, tearing down agent channel", self.task.id);
        self.idle_deadline = None;
        // An idle teardown interrupts the agent run; only an agent exit
        // records completed/failed.
        self.close_execution_session(ExecutionSessionStatus::Interrupted)
            .await;
        if let Some(channel) = self.channel.take() {
            channel.shutdown("idle timeout").await;
        }
        self.mark_task(TaskStatus::Idle).await;
        self.status = SupervisorStatus::Idle;
        self.publish_status(PublishedStatus::Idle);
    }

    // ========== Helpers ==========

    /// Pop one queued user turn and deliver it.
    async fn drain_one(&mut self) {
        if self.status != SupervisorStatus::Ready {
            return;
        }
        if let Some(text) = self.queue.pop_front() {
            self.deliver_turn(text).await;
        }
    }

    /// Close the open execution session, if any, with a session_end marker.
    async fn close_execution_session(&mut self, status: ExecutionSessionStatus) {
        let Some(session_id) = self.execution_session_id.take() else {
            return;
        };

        if let Err(e) = self
            .deps
            .store
            .complete_execution_session(session_id, status)
            .await
        {
            warn!(
                "failed to complete execution session {}: {:?}",
                session_id, e
            );
        }

        self.persist(NewMessage {
            task_id: self.task.id,
            execution_session_id: Some(session_id),
            kind: MessageKind::SessionEnd,
            content: None,
            tool_data: Some(json!({ "status": status.to_string() })),
        })
        .await;

        self.publish(SessionEvent::ExecutionSessionEnded {
            execution_session_id: session_id,
            status,
        });
    }

    async fn persist(&self, message: NewMessage) -> Option<i64> {
        match self.deps.store.create_message(message).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!("failed to persist message for task {}: {:?}", self.task.id, e);
                None
            }
        }
    }

    async fn mark_task(&self, status: TaskStatus) {
        if let Err(e) = self.deps.tasks.update_status(self.task.id, status).await {
            warn!("failed to update task {} status: {:?}", self.task.id, e);
        }
    }

    /// Persist and publish a user-facing error, then enter the error state.
    async fn fail_with_error(&mut self, message: String) {
        self.persist(NewMessage {
            task_id: self.task.id,
            execution_session_id: self.execution_session_id,
            kind: MessageKind::Error,
            content: Some(message.clone()),
            tool_data: None,
        })
        .await;
        self.publish(SessionEvent::AgentError { message });
        self.enter_error();
    }

    fn enter_error(&mut self) {
        self.status = SupervisorStatus::Error;
        self.publish_status(PublishedStatus::Error);
    }

    fn publish_status(&self, status: PublishedStatus) {
        self.publish(SessionEvent::Status { status });
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine; events are best-effort fan-out.
        let _ = self.events.send(event);
    }
}

/// Derive a task title from the first user turn.
fn derive_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or_default().trim();
    first_line.chars().take(TITLE_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::allocator::{Allocator, AllocatorConfig};
    use crate::channel::{ChannelCommand, test_channel_handle};
    use crate::db::Database;
    use crate::sprite::{
        ExecCommand, ExecOpts, ExecResult, Sprite, SpriteResult, StreamOpts,
    };
    use crate::token::{TokenConfig, TokenRepository};

    /// A sprite provider that accepts everything; the tests drive the state
    /// machine directly and never reach a real sandbox.
    struct NullSprites;

    #[async_trait]
    impl SpriteApi for NullSprites {
        async fn create(&self, name: &str, _public: bool) -> SpriteResult<Sprite> {
            Ok(Sprite {
                name: name.to_string(),
                status: Some("running".to_string()),
                extra: Default::default(),
            })
        }

        async fn get(&self, name: &str) -> SpriteResult<Sprite> {
            self.create(name, false).await
        }

        async fn list(&self) -> SpriteResult<Vec<Sprite>> {
            Ok(Vec::new())
        }

        async fn suspend(&self, _name: &str) -> SpriteResult<()> {
            Ok(())
        }

        async fn delete(&self, _name: &str) -> SpriteResult<()> {
            Ok(())
        }

        async fn exec(
            &self,
            _name: &str,
            _command: ExecCommand,
            _opts: ExecOpts,
        ) -> SpriteResult<ExecResult> {
            Ok(ExecResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }

        fn open_stream_url(
            &self,
            name: &str,
            _argv: &[String],
            _opts: &StreamOpts,
        ) -> SpriteResult<String> {
            Ok(format!("ws://127.0.0.1:9/v1/sprites/{name}/exec"))
        }

        fn auth_token(&self) -> &str {
            "test-token"
        }
    }

    /// A supervisor wired to an in-memory database and a test channel whose
    /// commands land in the returned receiver.
    async fn harness() -> (SessionSupervisor, mpsc::Receiver<ChannelCommand>) {
        let db = Database::in_memory().await.unwrap();
        let tasks = TaskRepository::new(db.pool().clone());
        let repos = RepoRepository::new(db.pool().clone());
        let store = ConversationStore::new(db.pool().clone());
        let tokens = Arc::new(TokenManager::new(
            TokenRepository::new(db.pool().clone()),
            TokenConfig {
                env_fallback: Some("test-token".to_string()),
                ..TokenConfig::default()
            },
        ));
        let sprites: Arc<dyn SpriteApi> = Arc::new(NullSprites);
        let allocator = Allocator::spawn(
            sprites.clone(),
            repos.clone(),
            AllocatorConfig::default(),
        );

        let task = tasks.create(None, None).await.unwrap();
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let (channel, chan_cmds) = test_channel_handle();

        let supervisor = SessionSupervisor {
            task,
            repo: None,
            deps: SessionDeps {
                allocator,
                sprites,
                tokens,
                store,
                tasks,
                repos,
                config: SessionConfig::default(),
            },
            status: SupervisorStatus::Connecting,
            sandbox_name: Some("test-box".to_string()),
            working_dir: Some("/home/sprite".to_string()),
            channel: Some(channel),
            chan_rx: None,
            execution_session_id: None,
            queue: VecDeque::new(),
            idle_deadline: None,
            events,
        };

        (supervisor, chan_cmds)
    }

    fn expect_user_turn(cmd: Option<ChannelCommand>) -> String {
        match cmd {
            Some(ChannelCommand::SendUserTurn(text)) => text,
            other => panic!("expected SendUserTurn, got {other:?}"),
        }
    }

    #[test]
    fn title_is_first_line_truncated() {
        assert_eq!(derive_title("fix the login bug\nmore detail"), "fix the login bug");
        let long = "x".repeat(200);
        assert_eq!(derive_title(&long).chars().count(), TITLE_MAX_CHARS);
        assert_eq!(derive_title("  padded  "), "padded");
    }

    #[tokio::test]
    async fn queued_turn_drains_on_message_stop_without_rearming_idle_timer() {
        let (mut sup, mut chan_cmds) = harness().await;

        sup.on_channel_ready().await;
        assert_eq!(sup.status, SupervisorStatus::Ready);

        // First turn goes straight out; a second one arrives mid-turn and
        // queues.
        sup.handle_send_message("first".to_string()).await;
        assert_eq!(sup.status, SupervisorStatus::Processing);
        sup.handle_send_message("second".to_string()).await;
        assert_eq!(sup.queue.len(), 1);

        // message_stop drains the queue; the drained turn is now running,
        // so the idle timer armed by message_stop must be cleared again.
        sup.on_agent_event(AgentEvent::MessageStop).await;
        assert_eq!(sup.status, SupervisorStatus::Processing);
        assert!(sup.queue.is_empty());
        assert!(
            sup.idle_deadline.is_none(),
            "idle timer must not fire while a drained turn is processing"
        );

        assert_eq!(expect_user_turn(chan_cmds.recv().await), "first");
        assert_eq!(expect_user_turn(chan_cmds.recv().await), "second");

        // Both turns persisted in order, inside the execution session.
        let session_id = sup.execution_session_id.unwrap();
        let messages = sup.deps.store.list_messages(sup.task.id, 50).await.unwrap();
        let turns: Vec<_> = messages
            .iter()
            .filter(|m| m.kind == MessageKind::User)
            .collect();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content.as_deref(), Some("first"));
        assert_eq!(turns[1].content.as_deref(), Some("second"));
        assert!(turns.iter().all(|m| m.execution_session_id == Some(session_id)));
    }

    #[tokio::test]
    async fn idle_timeout_interrupts_session_and_tears_down_channel() {
        let (mut sup, mut chan_cmds) = harness().await;

        sup.on_channel_ready().await;
        let session_id = sup.execution_session_id.unwrap();

        sup.idle_deadline = Some(Instant::now());
        sup.handle_idle_timeout().await;

        assert_eq!(sup.status, SupervisorStatus::Idle);
        assert!(sup.channel.is_none());
        assert!(sup.idle_deadline.is_none());
        assert!(sup.execution_session_id.is_none());

        // The channel was told to shut down (which pkills the agent).
        match chan_cmds.recv().await {
            Some(ChannelCommand::Shutdown { .. }) => {}
            other => panic!("expected Shutdown, got {other:?}"),
        }

        // The teardown is recorded as an interruption, not a clean exit.
        let session = sup
            .deps
            .store
            .get_execution_session(session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, ExecutionSessionStatus::Interrupted);
        assert!(session.ended_at.is_some());

        let task = sup.deps.tasks.get(sup.task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Idle);
    }

    #[tokio::test]
    async fn turn_sent_while_idle_wakes_and_delivers_exactly_once() {
        let (mut sup, _first_cmds) = harness().await;

        sup.on_channel_ready().await;
        let first_session = sup.execution_session_id.unwrap();
        sup.handle_idle_timeout().await;

        // A turn while idle queues and brings a channel back up.
        sup.handle_send_message("ping".to_string()).await;
        assert_eq!(sup.status, SupervisorStatus::Connecting);
        assert_eq!(sup.queue.len(), 1);
        assert!(sup.channel.is_some());

        // Stand in for the restarted channel and signal it ready.
        let (channel, mut chan_cmds) = test_channel_handle();
        sup.channel = Some(channel);
        sup.chan_rx = None;
        sup.on_channel_ready().await;

        // A fresh execution session opened and the queued turn went out
        // exactly once.
        let second_session = sup.execution_session_id.unwrap();
        assert_ne!(first_session, second_session);
        assert_eq!(sup.status, SupervisorStatus::Processing);
        assert!(sup.queue.is_empty());

        assert_eq!(expect_user_turn(chan_cmds.recv().await), "ping");
        assert!(chan_cmds.try_recv().is_err());

        let messages = sup.deps.store.list_messages(sup.task.id, 50).await.unwrap();
        let pings: Vec<_> = messages
            .iter()
            .filter(|m| m.content.as_deref() == Some("ping"))
            .collect();
        assert_eq!(pings.len(), 1);
        assert_eq!(pings[0].execution_session_id, Some(second_session));
    }
}
