//! Public-facing connection summaries.
//!
//! A [`SocialAccountProfile`] is what the owning user's client may read:
//! handle, aggregate counters, a short list of recent media and a few
//! provider-specific fields. It never carries credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod store;

pub use store::ProfileStore;

/// Connection summary for one (user, provider) pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialAccountProfile {
    pub connected: bool,
    /// Provider's id for the account (channel id, open id, business account id)
    pub account_id: String,
    pub username: String,
    /// Followers or subscribers
    pub follower_count: u64,
    /// Published videos or media
    pub media_count: u64,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub recent_media: Vec<MediaItem>,
    pub details: ProviderDetails,
}

impl SocialAccountProfile {
    /// Same profile ignoring `last_updated_at`.
    pub fn same_content(&self, other: &SocialAccountProfile) -> bool {
        let mut other = other.clone();
        other.last_updated_at = self.last_updated_at;
        *self == other
    }
}

/// One recent video or post, already reduced to display fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub comments: u64,
}

/// Fields only one provider reports.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderDetails {
    #[serde(rename_all = "camelCase")]
    YouTube {
        channel_thumbnail: Option<String>,
        view_count: u64,
    },
    #[serde(rename_all = "camelCase")]
    TikTok {
        avatar_url: Option<String>,
        display_name: String,
        following_count: u64,
        likes_count: u64,
    },
    #[serde(rename_all = "camelCase")]
    Instagram {
        page_id: Option<String>,
        profile_picture_url: Option<String>,
    },
}
