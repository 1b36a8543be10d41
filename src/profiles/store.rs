//! Profile storage using SQLite.
//!
//! Lives in its own database file, apart from the token store.

use super::{MediaItem, ProviderDetails, SocialAccountProfile};
use crate::connectors::Provider;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// Profile storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE social_profiles (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     connected INTEGER NOT NULL,
///     account_id TEXT NOT NULL,
///     username TEXT NOT NULL,
///     follower_count INTEGER NOT NULL,
///     media_count INTEGER NOT NULL,
///     last_updated_at TEXT NOT NULL,
///     recent_media TEXT NOT NULL,   -- JSON array
///     details TEXT NOT NULL,        -- JSON object
///     UNIQUE(user_id, provider)
/// );
/// ```
pub struct ProfileStore {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "provider, connected, account_id, username, follower_count, \
     media_count, last_updated_at, recent_media, details";

impl ProfileStore {
    /// Creates or opens a profile store.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open profiles database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS social_profiles (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                connected INTEGER NOT NULL,
                account_id TEXT NOT NULL,
                username TEXT NOT NULL,
                follower_count INTEGER NOT NULL,
                media_count INTEGER NOT NULL,
                last_updated_at TEXT NOT NULL,
                recent_media TEXT NOT NULL,
                details TEXT NOT NULL,
                UNIQUE(user_id, provider)
            )
            "#,
            [],
        )
        .context("Failed to create social_profiles table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_profiles_user ON social_profiles(user_id)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Stores the profile for a user and provider (upsert on the pair).
    pub fn save(&self, user_id: &str, provider: Provider, profile: &SocialAccountProfile) -> Result<()> {
        let recent_media =
            serde_json::to_string(&profile.recent_media).context("Failed to encode recent media")?;
        let details = serde_json::to_string(&profile.details).context("Failed to encode details")?;

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO social_profiles (
                    user_id, provider, connected, account_id, username,
                    follower_count, media_count, last_updated_at,
                    recent_media, details
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(user_id, provider) DO UPDATE SET
                    connected = excluded.connected,
                    account_id = excluded.account_id,
                    username = excluded.username,
                    follower_count = excluded.follower_count,
                    media_count = excluded.media_count,
                    last_updated_at = excluded.last_updated_at,
                    recent_media = excluded.recent_media,
                    details = excluded.details
                "#,
                params![
                    user_id,
                    provider.as_str(),
                    profile.connected,
                    profile.account_id,
                    profile.username,
                    to_sql_count(profile.follower_count),
                    to_sql_count(profile.media_count),
                    profile.last_updated_at.to_rfc3339(),
                    recent_media,
                    details,
                ],
            )
            .context("Failed to store profile")?;

        Ok(())
    }

    /// Retrieves the profile for a user and provider, `None` if absent.
    pub fn get(&self, user_id: &str, provider: Provider) -> Result<Option<SocialAccountProfile>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM social_profiles WHERE user_id = ?1 AND provider = ?2",
                SELECT_COLUMNS
            ))
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![user_id, provider.as_str()])
            .context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => Ok(Some(read_profile(row)?.1)),
            None => Ok(None),
        }
    }

    /// All profiles of one user, keyed by provider. Empty map if none.
    pub fn get_all(&self, user_id: &str) -> Result<BTreeMap<Provider, SocialAccountProfile>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM social_profiles WHERE user_id = ?1",
                SELECT_COLUMNS
            ))
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![user_id])
            .context("Failed to execute query")?;

        let mut profiles = BTreeMap::new();
        while let Some(row) = rows.next().context("Failed to read row")? {
            let (provider, profile) = read_profile(row)?;
            if let Some(provider) = provider {
                profiles.insert(provider, profile);
            }
        }
        Ok(profiles)
    }

    /// Deletes one provider's profile for a user.
    pub fn delete(&self, user_id: &str, provider: Provider) -> Result<bool> {
        let rows_affected = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM social_profiles WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider.as_str()],
            )
            .context("Failed to delete profile")?;

        Ok(rows_affected > 0)
    }

    /// Every user with at least one connected provider.
    pub fn list_connected_users(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT user_id FROM social_profiles WHERE connected = 1 ORDER BY user_id",
            )
            .context("Failed to prepare query")?;

        let users = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to execute query")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to read results")?;

        Ok(users)
    }
}

/// Decodes one row; the provider is `None` for rows naming an unknown provider.
fn read_profile(row: &Row<'_>) -> Result<(Option<Provider>, SocialAccountProfile)> {
    let provider: String = row.get(0)?;
    let last_updated_at: String = row.get(6)?;
    let recent_media: String = row.get(7)?;
    let details: String = row.get(8)?;

    let last_updated_at = DateTime::parse_from_rfc3339(&last_updated_at)
        .map(|dt| dt.with_timezone(&Utc))
        .context("Failed to parse last_updated_at timestamp")?;
    let recent_media: Vec<MediaItem> =
        serde_json::from_str(&recent_media).context("Failed to decode recent media")?;
    let details: ProviderDetails =
        serde_json::from_str(&details).context("Failed to decode provider details")?;

    let profile = SocialAccountProfile {
        connected: row.get(1)?,
        account_id: row.get(2)?,
        username: row.get(3)?,
        follower_count: from_sql_count(row.get(4)?),
        media_count: from_sql_count(row.get(5)?),
        last_updated_at,
        recent_media,
        details,
    };

    Ok((provider.parse().ok(), profile))
}

// SQLite integers are signed 64-bit
fn to_sql_count(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn from_sql_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> ProfileStore {
        ProfileStore::new(":memory:").expect("Failed to create test store")
    }

    fn profile(username: &str, followers: u64, details: ProviderDetails) -> SocialAccountProfile {
        SocialAccountProfile {
            connected: true,
            account_id: format!("{}-id", username),
            username: username.to_string(),
            follower_count: followers,
            media_count: 7,
            last_updated_at: Utc::now(),
            recent_media: vec![MediaItem {
                id: "m1".to_string(),
                title: "clip".to_string(),
                likes: 3,
                ..Default::default()
            }],
            details,
        }
    }

    fn tiktok_details() -> ProviderDetails {
        ProviderDetails::TikTok {
            avatar_url: Some("https://cdn.example.com/a.jpg".to_string()),
            display_name: "Dancer".to_string(),
            following_count: 10,
            likes_count: 5000,
        }
    }

    #[test]
    fn test_save_and_get() {
        let store = create_test_store();
        let saved = profile("dancer", 1500, tiktok_details());

        store.save("user1", Provider::TikTok, &saved).unwrap();

        let loaded = store.get("user1", Provider::TikTok).unwrap().unwrap();
        assert!(loaded.same_content(&saved));
        assert_eq!(
            loaded.last_updated_at.timestamp(),
            saved.last_updated_at.timestamp()
        );
    }

    #[test]
    fn test_get_nonexistent() {
        let store = create_test_store();
        assert!(store.get("nobody", Provider::YouTube).unwrap().is_none());
        assert!(store.get_all("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_save_merges_per_provider() {
        let store = create_test_store();
        let yt = profile(
            "channel",
            10,
            ProviderDetails::YouTube {
                channel_thumbnail: None,
                view_count: 100,
            },
        );
        store.save("user1", Provider::YouTube, &yt).unwrap();
        store.save("user1", Provider::TikTok, &profile("dancer", 20, tiktok_details())).unwrap();

        // Updating TikTok does not disturb YouTube
        store.save("user1", Provider::TikTok, &profile("dancer", 25, tiktok_details())).unwrap();

        let all = store.get_all("user1").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&Provider::YouTube].follower_count, 10);
        assert_eq!(all[&Provider::TikTok].follower_count, 25);
    }

    #[test]
    fn test_delete_only_that_provider() {
        let store = create_test_store();
        store.save("user1", Provider::TikTok, &profile("dancer", 20, tiktok_details())).unwrap();
        store
            .save(
                "user1",
                Provider::Instagram,
                &profile(
                    "insta",
                    30,
                    ProviderDetails::Instagram {
                        page_id: Some("p1".to_string()),
                        profile_picture_url: None,
                    },
                ),
            )
            .unwrap();

        assert!(store.delete("user1", Provider::TikTok).unwrap());
        assert!(!store.delete("user1", Provider::TikTok).unwrap());
        assert!(store.get("user1", Provider::Instagram).unwrap().is_some());
    }

    #[test]
    fn test_list_connected_users() {
        let store = create_test_store();
        store.save("b-user", Provider::TikTok, &profile("x", 1, tiktok_details())).unwrap();
        store.save("a-user", Provider::TikTok, &profile("y", 1, tiktok_details())).unwrap();
        store.save("a-user", Provider::YouTube, &profile("y", 1, tiktok_details())).unwrap();

        let mut disconnected = profile("z", 1, tiktok_details());
        disconnected.connected = false;
        store.save("c-user", Provider::TikTok, &disconnected).unwrap();

        assert_eq!(store.list_connected_users().unwrap(), vec!["a-user", "b-user"]);
    }
}
