//! HTTP client for the sprite provider API.

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::codec::{Frame, FrameDecoder};

use super::SpriteApi;
use super::error::{SpriteError, SpriteResult};

/// Default timeout for one-shot exec calls.
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// A sprite record as returned by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sprite {
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A command to run inside a sprite.
#[derive(Debug, Clone)]
pub enum ExecCommand {
    /// Explicit argv; each element becomes one `cmd` query parameter.
    Argv(Vec<String>),
    /// A shell string, wrapped as `/bin/sh -c <string>`.
    Shell(String),
}

impl ExecCommand {
    fn into_argv(self) -> Vec<String> {
        match self {
            ExecCommand::Argv(argv) => argv,
            ExecCommand::Shell(script) => {
                vec!["/bin/sh".to_string(), "-c".to_string(), script]
            }
        }
    }
}

impl From<&str> for ExecCommand {
    fn from(script: &str) -> Self {
        ExecCommand::Shell(script.to_string())
    }
}

/// Options for a blocking exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    /// Overall request timeout; defaults to 60 s.
    pub timeout: Option<Duration>,
    /// Environment entries passed as `env=KEY=VALUE` query parameters.
    pub env: Vec<(String, String)>,
}

impl ExecOpts {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            env: Vec::new(),
        }
    }
}

/// Result of a blocking exec, demultiplexed from the framed response body.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    /// Combined output, stdout first.
    pub fn output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}{}", self.stdout, self.stderr)
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Options for constructing a streaming exec URL.
#[derive(Debug, Clone)]
pub struct StreamOpts {
    pub tty: bool,
    pub stdin: bool,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl Default for StreamOpts {
    fn default() -> Self {
        Self {
            tty: false,
            stdin: true,
            cols: None,
            rows: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct UrlSettings {
    auth: &'static str,
}

#[derive(Debug, Serialize)]
struct CreateSpriteRequest<'a> {
    name: &'a str,
    url_settings: UrlSettings,
}

/// Client for the sprite provider API.
#[derive(Debug, Clone)]
pub struct SpriteClient {
    client: Client,
    base_url: String,
    token: String,
}

impl SpriteClient {
    /// Create a new client. `base_url` must be an `http(s)://` URL without a
    /// trailing slash; `token` is the provider bearer token.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn sprite_url(&self, name: &str) -> String {
        format!("{}/v1/sprites/{}", self.base_url, urlencoding::encode(name))
    }

    /// Build the `cmd=…&cmd=…&env=…` query string for an exec call.
    ///
    /// Every value is percent-encoded, including reserved characters such as
    /// `@` and `'` which git URLs and shell quoting rely on.
    fn exec_query(argv: &[String], env: &[(String, String)]) -> String {
        let mut parts: Vec<String> = argv
            .iter()
            .map(|arg| format!("cmd={}", urlencoding::encode(arg)))
            .collect();
        for (key, value) in env {
            parts.push(format!(
                "env={}",
                urlencoding::encode(&format!("{key}={value}"))
            ));
        }
        parts.join("&")
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> SpriteResult<T> {
        let status = response.status();
        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| SpriteError::ParseError(e.to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(SpriteError::ApiError {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl SpriteApi for SpriteClient {
    async fn create(&self, name: &str, public: bool) -> SpriteResult<Sprite> {
        let url = format!("{}/v1/sprites", self.base_url);
        let request = CreateSpriteRequest {
            name,
            url_settings: UrlSettings {
                auth: if public { "public" } else { "sprite" },
            },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await?;

        // 409 means the sprite already exists; creation is idempotent.
        if response.status() == StatusCode::CONFLICT {
            debug!("sprite {} already exists, reusing", name);
            return self.get(name).await;
        }

        Self::handle_response(response).await
    }

    async fn get(&self, name: &str) -> SpriteResult<Sprite> {
        let response = self
            .client
            .get(self.sprite_url(name))
            .bearer_auth(&self.token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(SpriteError::NotFound(name.to_string()));
        }
        Self::handle_response(response).await
    }

    async fn list(&self) -> SpriteResult<Vec<Sprite>> {
        let url = format!("{}/v1/sprites", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn suspend(&self, name: &str) -> SpriteResult<()> {
        let url = format!("{}/suspend", self.sprite_url(name));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(SpriteError::NotFound(name.to_string())),
            status => Err(SpriteError::ApiError {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn delete(&self, name: &str) -> SpriteResult<()> {
        let response = self
            .client
            .delete(self.sprite_url(name))
            .bearer_auth(&self.token)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(SpriteError::NotFound(name.to_string())),
            status => Err(SpriteError::ApiError {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn exec(
        &self,
        name: &str,
        command: ExecCommand,
        opts: ExecOpts,
    ) -> SpriteResult<ExecResult> {
        let argv = command.into_argv();
        let url = format!(
            "{}/exec?{}",
            self.sprite_url(name),
            Self::exec_query(&argv, &opts.env)
        );
        debug!("exec on sprite {}: {:?}", name, argv);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .timeout(opts.timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(SpriteError::NotFound(name.to_string()));
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SpriteError::ApiError { status, body });
        }

        let body = response.bytes().await?;
        let mut decoder = FrameDecoder::new();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = 0i32;

        for frame in decoder.feed(&body) {
            match frame {
                Frame::Stdout(chunk) => stdout.extend_from_slice(&chunk),
                Frame::Stderr(chunk) => stderr.extend_from_slice(&chunk),
                Frame::Exit(code) => exit_code = code as i32,
            }
        }

        if exit_code != 0 {
            warn!(
                "exec on sprite {} exited with {}: {:?}",
                name, exit_code, argv
            );
        }

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    fn open_stream_url(
        &self,
        name: &str,
        argv: &[String],
        opts: &StreamOpts,
    ) -> SpriteResult<String> {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(SpriteError::InvalidBaseUrl(self.base_url.clone()));
        };

        let mut query = Self::exec_query(argv, &[]);
        query.push_str(&format!("&tty={}&stdin={}", opts.tty, opts.stdin));
        if let Some(cols) = opts.cols {
            query.push_str(&format!("&cols={cols}"));
        }
        if let Some(rows) = opts.rows {
            query.push_str(&format!("&rows={rows}"));
        }

        Ok(format!(
            "{}/v1/sprites/{}/exec?{}",
            ws_base,
            urlencoding::encode(name),
            query
        ))
    }

    fn auth_token(&self) -> &str {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_query_encodes_reserved_characters() {
        let argv = vec!["git".to_string(), "clone".to_string()];
        let env = vec![(
            "TOKEN".to_string(),
            "x-access-token:'t@k'".to_string(),
        )];
        let query = SpriteClient::exec_query(&argv, &env);
        assert_eq!(
            query,
            "cmd=git&cmd=clone&env=TOKEN%3Dx-access-token%3A%27t%40k%27"
        );
    }

    #[test]
    fn shell_command_wraps_in_sh() {
        let argv = ExecCommand::Shell("echo hi".to_string()).into_argv();
        assert_eq!(argv, vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn stream_url_swaps_scheme_and_carries_flags() {
        let client = SpriteClient::new("https://api.example.com", "tok");
        let url = client
            .open_stream_url(
                "box-1",
                &["/bin/sh".to_string(), "-c".to_string(), "agent".to_string()],
                &StreamOpts::default(),
            )
            .unwrap();
        assert_eq!(
            url,
            "wss://api.example.com/v1/sprites/box-1/exec?cmd=%2Fbin%2Fsh&cmd=-c&cmd=agent&tty=false&stdin=true"
        );
    }

    #[test]
    fn stream_url_with_tty_dimensions() {
        let client = SpriteClient::new("http://localhost:8080", "tok");
        let opts = StreamOpts {
            tty: true,
            stdin: true,
            cols: Some(120),
            rows: Some(40),
        };
        let url = client
            .open_stream_url("b", &["bash".to_string()], &opts)
            .unwrap();
        assert!(url.starts_with("ws://localhost:8080/v1/sprites/b/exec?"));
        assert!(url.contains("tty=true"));
        assert!(url.contains("cols=120"));
        assert!(url.contains("rows=40"));
    }

    #[test]
    fn sprite_names_are_percent_encoded() {
        let client = SpriteClient::new("https://api.example.com", "tok");
        assert_eq!(
            client.sprite_url("user@box"),
            "https://api.example.com/v1/sprites/user%40box"
        );
    }
}
