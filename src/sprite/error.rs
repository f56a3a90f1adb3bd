//! Sprite API client error types.

use thiserror::Error;

/// Result type for sprite API operations.
pub type SpriteResult<T> = Result<T, SpriteError>;

/// Errors that can occur talking to the remote sprite API.
#[derive(Debug, Error)]
pub enum SpriteError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Sprite does not exist.
    #[error("sprite not found: {0}")]
    NotFound(String),

    /// The API returned an error response.
    #[error("sprite API error (status {status}): {body}")]
    ApiError { status: u16, body: String },

    /// Failed to parse a response.
    #[error("failed to parse response: {0}")]
    ParseError(String),

    /// The configured base URL is not usable.
    #[error("invalid sprite API base URL: {0}")]
    InvalidBaseUrl(String),
}
