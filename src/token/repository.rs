//! OAuth token database repository.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// The persisted OAuth token row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OauthToken {
    /// Row ID.
    pub id: i64,
    /// Owning user; null for the global singleton token.
    pub user_id: Option<String>,
    /// Current access token.
    #[serde(skip_serializing)]
    pub access_token: String,
    /// Current refresh token.
    #[serde(skip_serializing)]
    pub refresh_token: String,
    /// Expiry as unix milliseconds.
    pub expires_at: i64,
    /// Space-separated OAuth scopes.
    pub scopes: Option<String>,
    /// Provider subscription tier.
    pub subscription_tier: Option<String>,
    /// When the row was last written.
    pub updated_at: String,
}

/// Repository for the oauth_tokens table.
#[derive(Debug, Clone)]
pub struct TokenRepository {
    pool: SqlitePool,
}

impl TokenRepository {
    /// Create a new repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch the global token row (user_id IS NULL).
    pub async fn get_global(&self) -> Result<Option<OauthToken>> {
        let token = sqlx::query_as::<_, OauthToken>(
            r#"
            SELECT id, user_id, access_token, refresh_token, expires_at,
                   scopes, subscription_tier, updated_at
            FROM oauth_tokens
            WHERE user_id IS NULL
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("fetching oauth token")?;

        Ok(token)
    }

    /// Upsert the global token row.
    ///
    /// SQLite unique indexes admit multiple NULLs, so this is an explicit
    /// UPDATE-then-INSERT on `user_id IS NULL` rather than ON CONFLICT.
    pub async fn upsert_global(
        &self,
        access_token: &str,
        refresh_token: &str,
        expires_at: i64,
        scopes: Option<&str>,
        subscription_tier: Option<&str>,
    ) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE oauth_tokens
            SET access_token = ?, refresh_token = ?, expires_at = ?,
                scopes = ?, subscription_tier = ?, updated_at = datetime('now')
            WHERE user_id IS NULL
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(scopes)
        .bind(subscription_tier)
        .execute(&self.pool)
        .await
        .context("updating oauth token")?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO oauth_tokens
                    (user_id, access_token, refresh_token, expires_at, scopes, subscription_tier)
                VALUES (NULL, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(access_token)
            .bind(refresh_token)
            .bind(expires_at)
            .bind(scopes)
            .bind(subscription_tier)
            .execute(&self.pool)
            .await
            .context("inserting oauth token")?;
        }

        Ok(())
    }
}
