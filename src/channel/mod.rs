//! The agent channel: one streaming exec connection into a sprite.
//!
//! Owns the WebSocket to the sandbox, spawns the inner agent through it,
//! demultiplexes the framed stream, parses agent events, and forwards
//! everything to the owning session supervisor. Reconnects with bounded
//! backoff on abnormal disconnects; a 404 on the upgrade means the sandbox
//! is gone and is fatal.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::agent::{AgentEvent, encode_user_turn, parse_line};
use crate::codec::{Frame, FrameDecoder, INTERRUPT_BYTE, LineAssembler};
use crate::shell::sh_quote;
use crate::sprite::{ExecCommand, ExecOpts, SpriteApi, StreamOpts};

/// Maximum reconnection attempts before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Base delay for exponential backoff (milliseconds).
const BASE_BACKOFF_MS: u64 = 500;

/// Maximum backoff delay (milliseconds).
const MAX_BACKOFF_MS: u64 = 30_000;

/// Random jitter added on top of the backoff (milliseconds).
const BACKOFF_JITTER_MS: u64 = 250;

/// Mailbox depth for channel commands.
const COMMAND_BUFFER_SIZE: usize = 64;

/// Events forwarded from the channel to its owner, tagged with source.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The streaming connection is up and the agent is spawned.
    Ready,
    /// A parsed agent event from stdout.
    Event(AgentEvent),
    /// A stdout line that was not a valid event record.
    RawOutput(String),
    /// Stderr text from the agent process.
    Stderr(String),
    /// The agent process exited with this code.
    Exited { code: i32 },
    /// The connection dropped. Fatal disconnects are not retried.
    Disconnected { fatal: bool, reason: String },
    /// The channel shut down for good.
    Terminated { reason: String },
}

/// Commands the owner can send down the channel.
#[derive(Debug)]
pub(crate) enum ChannelCommand {
    SendUserTurn(String),
    Interrupt,
    Shutdown { reason: String },
}

/// What the channel needs to launch the agent.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub sandbox_name: String,
    pub working_dir: String,
    /// Repo display name for the system prompt, if the task has one.
    pub repo_display_name: Option<String>,
    /// OAuth access token handed to the agent process.
    pub oauth_token: String,
    /// GitHub token forwarded as GH_TOKEN, if configured.
    pub github_token: Option<String>,
}

/// Handle for the owner to drive the channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    tx: mpsc::Sender<ChannelCommand>,
}

impl ChannelHandle {
    /// Write one user turn as a single stream-json frame.
    pub async fn send_user_turn(&self, text: String) -> bool {
        self.tx
            .send(ChannelCommand::SendUserTurn(text))
            .await
            .is_ok()
    }

    /// Write the interrupt byte.
    pub async fn interrupt(&self) -> bool {
        self.tx.send(ChannelCommand::Interrupt).await.is_ok()
    }

    /// Gracefully shut the channel down; pkills the agent so the sandbox can
    /// hibernate.
    pub async fn shutdown(&self, reason: impl Into<String>) {
        let _ = self
            .tx
            .send(ChannelCommand::Shutdown {
                reason: reason.into(),
            })
            .await;
    }
}

/// Test-only handle whose commands land in the returned receiver instead of
/// a live connection.
#[cfg(test)]
pub(crate) fn test_channel_handle() -> (ChannelHandle, mpsc::Receiver<ChannelCommand>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
    (ChannelHandle { tx }, rx)
}

enum StreamEnd {
    /// The agent exited with a code.
    Exited(i32),
    /// The owner asked us to stop.
    Shutdown(String),
}

struct StreamError {
    fatal: bool,
    /// Whether the WebSocket had connected before failing.
    connected: bool,
    reason: String,
}

/// The channel actor.
pub struct AgentChannel {
    sprites: Arc<dyn SpriteApi>,
    config: ChannelConfig,
    events: mpsc::Sender<ChannelEvent>,
}

impl AgentChannel {
    /// Spawn the channel actor; events arrive on `events`.
    pub fn spawn(
        sprites: Arc<dyn SpriteApi>,
        config: ChannelConfig,
        events: mpsc::Sender<ChannelEvent>,
    ) -> ChannelHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let channel = Self {
            sprites,
            config,
            events,
        };
        tokio::spawn(channel.run(rx));
        ChannelHandle { tx }
    }

    async fn run(self, mut cmd_rx: mpsc::Receiver<ChannelCommand>) {
        let mut attempt = 0u32;

        loop {
            if attempt > 0 {
                let delay = calculate_backoff(attempt);
                debug!(
                    "channel to {} reconnecting in {} ms (attempt {})",
                    self.config.sandbox_name, delay, attempt
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            match self.connect_and_stream(&mut cmd_rx).await {
                Ok(StreamEnd::Shutdown(reason)) => {
                    self.pkill_agent();
                    let _ = self.events.send(ChannelEvent::Terminated { reason }).await;
                    break;
                }
                Ok(StreamEnd::Exited(code)) => {
                    let _ = self.events.send(ChannelEvent::Exited { code }).await;
                    let _ = self
                        .events
                        .send(ChannelEvent::Terminated {
                            reason: format!("agent exited with code {code}"),
                        })
                        .await;
                    break;
                }
                Err(err) if err.fatal => {
                    error!(
                        "fatal disconnect from sprite {}: {}",
                        self.config.sandbox_name, err.reason
                    );
                    let _ = self
                        .events
                        .send(ChannelEvent::Disconnected {
                            fatal: true,
                            reason: err.reason,
                        })
                        .await;
                    break;
                }
                Err(err) => {
                    // A connection that had been up resets the attempt count.
                    attempt = if err.connected { 1 } else { attempt + 1 };
                    warn!(
                        "channel to {} disconnected (attempt {}): {}",
                        self.config.sandbox_name, attempt, err.reason
                    );

                    if attempt >= MAX_RECONNECT_ATTEMPTS {
                        let _ = self
                            .events
                            .send(ChannelEvent::Disconnected {
                                fatal: true,
                                reason: format!(
                                    "gave up after {MAX_RECONNECT_ATTEMPTS} reconnect attempts: {}",
                                    err.reason
                                ),
                            })
                            .await;
                        break;
                    }

                    let _ = self
                        .events
                        .send(ChannelEvent::Disconnected {
                            fatal: false,
                            reason: err.reason,
                        })
                        .await;
                }
            }
        }
    }

    /// Open the streaming exec and pump frames until the stream ends.
    async fn connect_and_stream(
        &self,
        cmd_rx: &mut mpsc::Receiver<ChannelCommand>,
    ) -> Result<StreamEnd, StreamError> {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            build_launch_command(&self.config),
        ];
        let opts = StreamOpts {
            tty: false,
            stdin: true,
            cols: None,
            rows: None,
        };
        let url = self
            .sprites
            .open_stream_url(&self.config.sandbox_name, &argv, &opts)
            .map_err(|e| StreamError {
                fatal: true,
                connected: false,
                reason: e.to_string(),
            })?;

        let mut request = url.into_client_request().map_err(|e| StreamError {
            fatal: true,
            connected: false,
            reason: format!("invalid stream URL: {e}"),
        })?;
        let bearer = format!("Bearer {}", self.sprites.auth_token());
        request.headers_mut().insert(
            AUTHORIZATION,
            bearer.parse().map_err(|e| StreamError {
                fatal: true,
                connected: false,
                reason: format!("invalid auth header: {e}"),
            })?,
        );

        let (ws, _) = match connect_async(request).await {
            Ok(ok) => ok,
            // A 404 on the upgrade means the sandbox is gone. Do not retry.
            Err(WsError::Http(response)) if response.status() == StatusCode::NOT_FOUND => {
                return Err(StreamError {
                    fatal: true,
                    connected: false,
                    reason: "sandbox gone (404 on stream upgrade)".to_string(),
                });
            }
            Err(e) => {
                return Err(StreamError {
                    fatal: false,
                    connected: false,
                    reason: e.to_string(),
                });
            }
        };

        info!(
            "agent stream up for sprite {} in {}",
            self.config.sandbox_name, self.config.working_dir
        );
        if self.events.send(ChannelEvent::Ready).await.is_err() {
            return Ok(StreamEnd::Shutdown("owner gone".to_string()));
        }

        let (mut write, mut read) = ws.split();
        let mut decoder = FrameDecoder::new();
        let mut lines = LineAssembler::new();

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        for frame in decoder.feed(&data) {
                            match frame {
                                Frame::Stdout(chunk) => {
                                    for line in lines.push(&chunk) {
                                        let event = match parse_line(&line) {
                                            Some(event) => ChannelEvent::Event(event),
                                            None => ChannelEvent::RawOutput(line),
                                        };
                                        if self.events.send(event).await.is_err() {
                                            return Ok(StreamEnd::Shutdown("owner gone".to_string()));
                                        }
                                    }
                                }
                                Frame::Stderr(chunk) => {
                                    let text = String::from_utf8_lossy(&chunk).into_owned();
                                    if self.events.send(ChannelEvent::Stderr(text)).await.is_err() {
                                        return Ok(StreamEnd::Shutdown("owner gone".to_string()));
                                    }
                                }
                                Frame::Exit(code) => {
                                    // Flush whatever was buffered as unparsed output.
                                    if let Some(rest) = lines.flush() {
                                        let _ = self.events.send(ChannelEvent::RawOutput(rest)).await;
                                    }
                                    return Ok(StreamEnd::Exited(code as i32));
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(StreamError {
                            fatal: false,
                            connected: true,
                            reason: "stream closed".to_string(),
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(StreamError {
                            fatal: false,
                            connected: true,
                            reason: e.to_string(),
                        });
                    }
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(ChannelCommand::SendUserTurn(text)) => {
                        let line = encode_user_turn(&text);
                        if let Err(e) = write.send(Message::Binary(line.into_bytes().into())).await {
                            return Err(StreamError {
                                fatal: false,
                                connected: true,
                                reason: format!("write failed: {e}"),
                            });
                        }
                    }
                    Some(ChannelCommand::Interrupt) => {
                        if let Err(e) = write.send(Message::Binary(vec![INTERRUPT_BYTE].into())).await {
                            return Err(StreamError {
                                fatal: false,
                                connected: true,
                                reason: format!("interrupt write failed: {e}"),
                            });
                        }
                    }
                    Some(ChannelCommand::Shutdown { reason }) => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(StreamEnd::Shutdown(reason));
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(StreamEnd::Shutdown("owner dropped handle".to_string()));
                    }
                },
            }
        }
    }

    /// Fire-and-forget pkill of the agent so the sandbox can hibernate.
    fn pkill_agent(&self) {
        let sprites = self.sprites.clone();
        let sandbox_name = self.config.sandbox_name.clone();
        tokio::spawn(async move {
            let result = sprites
                .exec(
                    &sandbox_name,
                    ExecCommand::Shell("pkill -f 'agent --print'".to_string()),
                    ExecOpts::with_timeout(Duration::from_secs(10)),
                )
                .await;
            if let Err(e) = result {
                debug!("pkill in sprite {} failed: {}", sandbox_name, e);
            }
        });
    }
}

/// Build the shell command that launches the agent in its working directory.
fn build_launch_command(config: &ChannelConfig) -> String {
    let mut env_prefix = format!("AGENT_OAUTH_TOKEN={}", sh_quote(&config.oauth_token));
    if let Some(gh) = &config.github_token {
        env_prefix.push_str(&format!(" GH_TOKEN={}", sh_quote(gh)));
    }

    let mut command = format!(
        "cd {} && {} agent --print --input-format stream-json --output-format stream-json --verbose",
        sh_quote(&config.working_dir),
        env_prefix
    );

    if let Some(name) = &config.repo_display_name {
        let prompt = format!("You are working in the {name} repository.");
        command.push_str(&format!(" --append-system-prompt {}", sh_quote(&prompt)));
    }

    command
}

/// Exponential backoff with jitter, capped.
fn calculate_backoff(attempt: u32) -> u64 {
    let exp = BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(6));
    exp.min(MAX_BACKOFF_MS) + rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChannelConfig {
        ChannelConfig {
            sandbox_name: "box".to_string(),
            working_dir: "/home/sprite/repos/acme/widget".to_string(),
            repo_display_name: Some("acme/widget".to_string()),
            oauth_token: "tok-123".to_string(),
            github_token: None,
        }
    }

    #[test]
    fn launch_command_carries_env_and_flags() {
        let cmd = build_launch_command(&config());
        assert!(cmd.starts_with("cd '/home/sprite/repos/acme/widget' && "));
        assert!(cmd.contains("AGENT_OAUTH_TOKEN='tok-123'"));
        assert!(cmd.contains(
            "agent --print --input-format stream-json --output-format stream-json --verbose"
        ));
        assert!(cmd.contains(
            "--append-system-prompt 'You are working in the acme/widget repository.'"
        ));
        assert!(!cmd.contains("GH_TOKEN"));
    }

    #[test]
    fn launch_command_includes_github_token_when_set() {
        let mut cfg = config();
        cfg.github_token = Some("gh-1".to_string());
        let cmd = build_launch_command(&cfg);
        assert!(cmd.contains("GH_TOKEN='gh-1'"));
    }

    #[test]
    fn launch_command_escapes_quotes_in_repo_name() {
        let mut cfg = config();
        cfg.repo_display_name = Some("o'brien/widget".to_string());
        let cmd = build_launch_command(&cfg);
        assert!(cmd.contains(r"the o'\''brien/widget repository"));
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let first = calculate_backoff(1);
        assert!(first >= 1_000 && first <= 1_000 + BACKOFF_JITTER_MS);

        for attempt in 1..20 {
            let delay = calculate_backoff(attempt);
            assert!(delay <= MAX_BACKOFF_MS + BACKOFF_JITTER_MS);
        }
    }
}
