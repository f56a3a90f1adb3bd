//! The token manager: serialized refresh of the live OAuth token.

use chrono::Utc;
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use super::repository::TokenRepository;

/// Errors from token operations.
#[derive(Debug, Error)]
pub enum TokenError {
    /// No token in the database and no environment fallback.
    #[error("no OAuth token configured; seed one first")]
    NoTokenConfigured,

    /// The provider rejected the refresh.
    #[error("token refresh failed (status {status}): {body}")]
    RefreshFailed { status: u16, body: String },

    /// The provider's response was not the expected shape.
    #[error("invalid refresh response: {0}")]
    InvalidRefreshResponse(String),

    /// Transport failure talking to the provider.
    #[error("token endpoint request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Database failure while loading the token.
    #[error("token storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Token manager configuration.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Provider token endpoint, e.g. `https://auth.example.com/v1/oauth/token`.
    pub token_endpoint: String,
    /// OAuth client id sent with refresh requests.
    pub client_id: String,
    /// Refresh this long before `expires_at`.
    pub refresh_buffer: Duration,
    /// Legacy fallback access token (`AGENT_OAUTH_TOKEN`) used when the
    /// database holds no row.
    pub env_fallback: Option<String>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            token_endpoint: "https://auth.example.com/v1/oauth/token".to_string(),
            client_id: "spritedock".to_string(),
            refresh_buffer: Duration::from_secs(5 * 60),
            env_fallback: None,
        }
    }
}

/// The in-memory token state.
#[derive(Debug, Clone)]
struct LiveToken {
    access_token: String,
    refresh_token: String,
    expires_at: i64,
    scopes: Option<String>,
    subscription_tier: Option<String>,
}

impl LiveToken {
    /// Whether the token expires within `buffer` of `now_ms`.
    fn expires_within(&self, buffer: Duration, now_ms: i64) -> bool {
        self.expires_at - now_ms <= buffer.as_millis() as i64
    }
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
    client_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    #[allow(dead_code)]
    token_type: Option<String>,
}

/// Singleton owner of the live OAuth state.
///
/// All operations go through one async mutex, so at most one refresh is in
/// flight and concurrent callers observe its result.
pub struct TokenManager {
    repo: TokenRepository,
    http: Client,
    config: TokenConfig,
    state: Mutex<Option<LiveToken>>,
}

impl TokenManager {
    /// Create a new manager.
    pub fn new(repo: TokenRepository, config: TokenConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to create HTTP client");

        Self {
            repo,
            http,
            config,
            state: Mutex::new(None),
        }
    }

    /// Return a currently-valid access token, refreshing first if it is
    /// expired or inside the refresh buffer.
    pub async fn get_access_token(&self) -> Result<String, TokenError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let Some(live) = state.as_mut() else {
            // Nothing persisted; fall back to the static env token.
            return self
                .config
                .env_fallback
                .clone()
                .ok_or(TokenError::NoTokenConfigured);
        };

        if live.expires_within(self.config.refresh_buffer, Utc::now().timestamp_millis()) {
            debug!("access token inside refresh buffer, refreshing");
            self.refresh_locked(live).await?;
        }

        Ok(live.access_token.clone())
    }

    /// Refresh unconditionally and return the new access token.
    pub async fn force_refresh(&self) -> Result<String, TokenError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        let Some(live) = state.as_mut() else {
            return Err(TokenError::NoTokenConfigured);
        };

        self.refresh_locked(live).await?;
        Ok(live.access_token.clone())
    }

    /// Upsert the singleton token.
    pub async fn seed(
        &self,
        access_token: &str,
        refresh_token: &str,
        expires_at: i64,
        scopes: Option<&str>,
        subscription_tier: Option<&str>,
    ) -> Result<(), TokenError> {
        self.repo
            .upsert_global(access_token, refresh_token, expires_at, scopes, subscription_tier)
            .await?;

        let mut state = self.state.lock().await;
        *state = Some(LiveToken {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at,
            scopes: scopes.map(str::to_string),
            subscription_tier: subscription_tier.map(str::to_string),
        });

        info!("seeded OAuth token, expires_at={}", expires_at);
        Ok(())
    }

    /// Expiry of the current token, if one is loaded or stored.
    pub async fn expires_at(&self) -> Result<Option<i64>, TokenError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state.as_ref().map(|live| live.expires_at))
    }

    /// Load the persisted row into memory if nothing is loaded yet.
    async fn ensure_loaded(&self, state: &mut Option<LiveToken>) -> Result<(), TokenError> {
        if state.is_some() {
            return Ok(());
        }

        if let Some(row) = self.repo.get_global().await? {
            *state = Some(LiveToken {
                access_token: row.access_token,
                refresh_token: row.refresh_token,
                expires_at: row.expires_at,
                scopes: row.scopes,
                subscription_tier: row.subscription_tier,
            });
        }
        Ok(())
    }

    /// Run the refresh protocol while holding the state lock.
    ///
    /// On success the rotated token is persisted before the caller sees it;
    /// a persistence failure still hands out the in-memory token so the
    /// agent does not stall on a database outage. A single transient provider
    /// failure is retried once.
    async fn refresh_locked(&self, live: &mut LiveToken) -> Result<(), TokenError> {
        // One transient provider failure is retried; a second error goes to
        // the caller with the old access token left in memory.
        let parsed = match self.request_refresh(&live.refresh_token).await {
            Ok(parsed) => parsed,
            Err(first) => {
                warn!("token refresh attempt failed, retrying once: {}", first);
                self.request_refresh(&live.refresh_token).await?
            }
        };

        live.access_token = parsed.access_token;
        // Token rotation: the provider may hand back a new refresh token
        // that replaces the prior one.
        if let Some(rotated) = parsed.refresh_token {
            live.refresh_token = rotated;
        }
        live.expires_at = Utc::now().timestamp_millis() + parsed.expires_in * 1000;

        if let Err(e) = self
            .repo
            .upsert_global(
                &live.access_token,
                &live.refresh_token,
                live.expires_at,
                live.scopes.as_deref(),
                live.subscription_tier.as_deref(),
            )
            .await
        {
            warn!("refreshed token could not be persisted: {:?}", e);
        }

        info!("OAuth token refreshed, expires_at={}", live.expires_at);
        Ok(())
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<RefreshResponse, TokenError> {
        let request = RefreshRequest {
            grant_type: "refresh_token",
            refresh_token,
            client_id: &self.config.client_id,
        };

        let response = self
            .http
            .post(&self.config.token_endpoint)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::RefreshFailed {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<RefreshResponse>()
            .await
            .map_err(|e| TokenError::InvalidRefreshResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn live(expires_at: i64) -> LiveToken {
        LiveToken {
            access_token: "acc".to_string(),
            refresh_token: "ref".to_string(),
            expires_at,
            scopes: None,
            subscription_tier: None,
        }
    }

    #[test]
    fn refresh_buffer_triggers_before_expiry() {
        let buffer = Duration::from_secs(300);
        let now = 1_000_000_000;

        // Expires in 60 s with a 5 min buffer: refresh.
        assert!(live(now + 60_000).expires_within(buffer, now));
        // Already expired: refresh.
        assert!(live(now - 1).expires_within(buffer, now));
        // Expires in an hour: no refresh.
        assert!(!live(now + 3_600_000).expires_within(buffer, now));
    }

    #[tokio::test]
    async fn seed_then_get_returns_token_without_refresh() {
        let db = Database::in_memory().await.unwrap();
        let manager = TokenManager::new(
            TokenRepository::new(db.pool().clone()),
            TokenConfig::default(),
        );

        let far_future = Utc::now().timestamp_millis() + 3_600_000;
        manager
            .seed("access-1", "refresh-1", far_future, Some("user:inference"), Some("pro"))
            .await
            .unwrap();

        let token = manager.get_access_token().await.unwrap();
        assert_eq!(token, "access-1");
    }

    #[tokio::test]
    async fn missing_token_without_fallback_errors() {
        let db = Database::in_memory().await.unwrap();
        let manager = TokenManager::new(
            TokenRepository::new(db.pool().clone()),
            TokenConfig::default(),
        );

        match manager.get_access_token().await {
            Err(TokenError::NoTokenConfigured) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn env_fallback_used_when_db_empty() {
        let db = Database::in_memory().await.unwrap();
        let config = TokenConfig {
            env_fallback: Some("legacy-token".to_string()),
            ..TokenConfig::default()
        };
        let manager = TokenManager::new(TokenRepository::new(db.pool().clone()), config);

        assert_eq!(manager.get_access_token().await.unwrap(), "legacy-token");
    }

    #[tokio::test]
    async fn manager_reads_previously_persisted_row() {
        let db = Database::in_memory().await.unwrap();
        let repo = TokenRepository::new(db.pool().clone());
        let far_future = Utc::now().timestamp_millis() + 3_600_000;
        repo.upsert_global("persisted", "ref", far_future, None, None)
            .await
            .unwrap();

        let manager = TokenManager::new(repo, TokenConfig::default());
        assert_eq!(manager.get_access_token().await.unwrap(), "persisted");
    }
}
