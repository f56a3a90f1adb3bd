//! OAuth token management for the inner agent.
//!
//! One token row per process (the global row has a null user id). The
//! manager keeps the live token in memory, refreshes it proactively before
//! expiry, and persists rotations.

mod manager;
mod repository;

pub use manager::{TokenConfig, TokenError, TokenManager};
pub use repository::{OauthToken, TokenRepository};
