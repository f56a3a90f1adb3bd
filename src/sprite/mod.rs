//! Remote sprite (sandbox VM) API client.
//!
//! Stateless HTTP/WebSocket facade over the sprite provider. The [`SpriteApi`]
//! trait is the seam the allocator and session supervisor depend on, so tests
//! can substitute a stub without a remote API.

mod client;
mod error;

pub use client::{ExecCommand, ExecOpts, ExecResult, Sprite, SpriteClient, StreamOpts};
pub use error::{SpriteError, SpriteResult};

use async_trait::async_trait;

/// Operations the orchestrator needs from the sprite provider.
#[async_trait]
pub trait SpriteApi: Send + Sync {
    /// Create a sprite, or return the existing one with the same name.
    async fn create(&self, name: &str, public: bool) -> SpriteResult<Sprite>;

    /// Fetch a sprite by name.
    async fn get(&self, name: &str) -> SpriteResult<Sprite>;

    /// List all sprites.
    async fn list(&self) -> SpriteResult<Vec<Sprite>>;

    /// Ask the provider to suspend (hibernate) a sprite.
    async fn suspend(&self, name: &str) -> SpriteResult<()>;

    /// Delete a sprite.
    async fn delete(&self, name: &str) -> SpriteResult<()>;

    /// Run a command to completion inside the sprite.
    async fn exec(&self, name: &str, command: ExecCommand, opts: ExecOpts)
        -> SpriteResult<ExecResult>;

    /// Construct the WebSocket URL for a streaming exec. No side effects.
    fn open_stream_url(&self, name: &str, argv: &[String], opts: &StreamOpts)
        -> SpriteResult<String>;

    /// Bearer token for authenticating the WebSocket upgrade.
    fn auth_token(&self) -> &str;
}
