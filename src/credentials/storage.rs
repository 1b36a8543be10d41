//! Token bundle storage using SQLite.
//!
//! One row per (user, provider). Writes are upserts on that pair, so saving
//! one provider's bundle never touches another provider's row for the same user.

use super::TokenBundle;
use crate::connectors::Provider;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Mutex;

/// Token bundle storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE oauth_tokens (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     access_token TEXT NOT NULL,
///     refresh_token TEXT,               -- absent for fixed-lifetime tokens
///     expires_at TEXT NOT NULL,         -- RFC 3339
///     provider_account_id TEXT NOT NULL,
///     extra TEXT NOT NULL,              -- JSON object
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     UNIQUE(user_id, provider)
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex for safe concurrent access
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`:memory:` for tests)
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open credentials database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_tokens (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                expires_at TEXT NOT NULL,
                provider_account_id TEXT NOT NULL,
                extra TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, provider)
            )
            "#,
            [],
        )
        .context("Failed to create oauth_tokens table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tokens_user ON oauth_tokens(user_id)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Stores the bundle for a user and provider (upsert).
    ///
    /// Other providers' bundles for the same user are untouched. `created_at`
    /// survives updates.
    pub fn save(&self, user_id: &str, provider: Provider, bundle: &TokenBundle) -> Result<()> {
        let extra = serde_json::to_string(&bundle.extra).context("Failed to encode extra fields")?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO oauth_tokens (
                    user_id, provider,
                    access_token, refresh_token, expires_at,
                    provider_account_id, extra,
                    created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(user_id, provider) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    provider_account_id = excluded.provider_account_id,
                    extra = excluded.extra,
                    updated_at = excluded.updated_at
                "#,
                params![
                    user_id,
                    provider.as_str(),
                    bundle.access_token,
                    bundle.refresh_token,
                    bundle.expires_at.to_rfc3339(),
                    bundle.provider_account_id,
                    extra,
                    now,
                    now,
                ],
            )
            .context("Failed to store token bundle")?;

        Ok(())
    }

    /// Retrieves the bundle for a user and provider.
    ///
    /// # Returns
    /// * `Ok(Some(TokenBundle))` - Bundle found
    /// * `Ok(None)` - Nothing stored for this pair
    pub fn get(&self, user_id: &str, provider: Provider) -> Result<Option<TokenBundle>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT access_token, refresh_token, expires_at,
                       provider_account_id, extra
                FROM oauth_tokens
                WHERE user_id = ?1 AND provider = ?2
                "#,
            )
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![user_id, provider.as_str()])
            .context("Failed to execute query")?;

        let Some(row) = rows.next().context("Failed to read row")? else {
            return Ok(None);
        };

        let access_token: String = row.get(0)?;
        let refresh_token: Option<String> = row.get(1)?;
        let expires_at: String = row.get(2)?;
        let provider_account_id: String = row.get(3)?;
        let extra: String = row.get(4)?;

        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map(|dt| dt.with_timezone(&Utc))
            .context("Failed to parse expires_at timestamp")?;
        let extra: Map<String, Value> =
            serde_json::from_str(&extra).context("Failed to decode extra fields")?;

        Ok(Some(TokenBundle {
            access_token,
            refresh_token,
            expires_at,
            provider_account_id,
            extra,
        }))
    }

    /// Deletes one provider's bundle for a user.
    ///
    /// # Returns
    /// * `Ok(true)` - Bundle deleted
    /// * `Ok(false)` - Nothing was stored
    pub fn delete(&self, user_id: &str, provider: Provider) -> Result<bool> {
        let rows_affected = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM oauth_tokens WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider.as_str()],
            )
            .context("Failed to delete token bundle")?;

        Ok(rows_affected > 0)
    }
}
