//! YouTube connector (Google OAuth + YouTube Data API v3).
//!
//! Google issues a refresh token only when the consent screen is forced and
//! offline access is requested, so the authorize URL always asks for both.
//! Refresh tokens are normally not rotated; the old one is kept.

use super::http::{count, decode, expiry_after, string, CallError, ProviderHttp};
use super::{
    build_authorize_url, Provider, ProviderConnector, ProviderEndpoints, ProviderError,
};
use crate::clock::Clock;
use crate::config::ProviderCredentials;
use crate::credentials::TokenBundle;
use crate::profiles::{MediaItem, ProviderDetails, SocialAccountProfile};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const BASE_URL: &str = "https://www.googleapis.com";
pub const SCOPE: &str = "https://www.googleapis.com/auth/youtube.readonly";

/// Number of recent uploads listed on a profile
const RECENT_VIDEOS: usize = 6;

/// Google token lifetime when `expires_in` is missing (seconds)
const DEFAULT_EXPIRES_IN: i64 = 3600;

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ListResponse {
    items: Vec<Value>,
}

pub struct YouTubeConnector {
    credentials: ProviderCredentials,
    endpoints: ProviderEndpoints,
    http: ProviderHttp,
    clock: Arc<dyn Clock>,
}

impl YouTubeConnector {
    pub fn new(credentials: ProviderCredentials, client: reqwest::Client, clock: Arc<dyn Clock>) -> Self {
        Self {
            credentials,
            endpoints: Self::default_endpoints(),
            http: ProviderHttp::new(client),
            clock,
        }
    }

    pub fn default_endpoints() -> ProviderEndpoints {
        ProviderEndpoints {
            authorize_url: AUTH_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            api_base: BASE_URL.to_string(),
        }
    }

    /// Use custom endpoints (for testing with a mock server).
    pub fn with_endpoints(mut self, endpoints: ProviderEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    async fn token_request(&self, form: &[(&str, &str)], secrets: &[&str]) -> Result<TokenResponse, CallError> {
        let request = self.http.client().post(&self.endpoints.token_url).form(form);
        let json = self.http.send_json(request, secrets).await?;
        let token: TokenResponse = decode(json)?;
        if token.access_token.as_deref().unwrap_or_default().is_empty() {
            return Err(CallError::Failed("response has no access_token".to_string()));
        }
        Ok(token)
    }

    fn bundle_from(&self, token: TokenResponse, previous: Option<&TokenBundle>) -> Result<TokenBundle, CallError> {
        let expires_at = expiry_after(self.clock.now(), token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN))?;
        let mut extra = previous.map(|b| b.extra.clone()).unwrap_or_else(Map::new);
        if let Some(scope) = token.scope {
            extra.insert("scope".to_string(), Value::String(scope));
        }

        Ok(TokenBundle {
            access_token: token.access_token.unwrap_or_default(),
            refresh_token: token
                .refresh_token
                .or_else(|| previous.and_then(|b| b.refresh_token.clone())),
            expires_at,
            provider_account_id: previous
                .map(|b| b.provider_account_id.clone())
                .unwrap_or_default(),
            extra,
        })
    }

    async fn api_get(&self, path: &str, query: &[(&str, &str)], bundle: &TokenBundle) -> Result<ListResponse, CallError> {
        let request = self
            .http
            .client()
            .get(format!("{}{}", self.endpoints.api_base, path))
            .query(query)
            .bearer_auth(&bundle.access_token);
        decode(self.http.send_json(request, &bundle.secrets()).await?)
    }

    /// Most recent uploads with their statistics, newest first.
    async fn recent_videos(&self, bundle: &TokenBundle, uploads_playlist: &str) -> Result<Vec<MediaItem>, CallError> {
        let max_results = RECENT_VIDEOS.to_string();
        let playlist = self
            .api_get(
                "/youtube/v3/playlistItems",
                &[
                    ("part", "snippet,contentDetails"),
                    ("playlistId", uploads_playlist),
                    ("maxResults", &max_results),
                ],
                bundle,
            )
            .await?;

        let ids: Vec<String> = playlist
            .items
            .iter()
            .filter_map(|item| string(item.pointer("/contentDetails/videoId")))
            .take(RECENT_VIDEOS)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let joined = ids.join(",");
        let videos = self
            .api_get(
                "/youtube/v3/videos",
                &[("part", "snippet,statistics"), ("id", &joined)],
                bundle,
            )
            .await?;

        let mut by_id: HashMap<String, MediaItem> = videos
            .items
            .iter()
            .filter_map(video_item)
            .map(|item| (item.id.clone(), item))
            .collect();

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }
}

fn thumbnail(snippet: Option<&Value>) -> Option<String> {
    let thumbnails = snippet?.get("thumbnails")?;
    ["high", "medium", "default"]
        .iter()
        .find_map(|size| string(thumbnails.get(size).and_then(|t| t.get("url"))))
}

fn video_item(video: &Value) -> Option<MediaItem> {
    let id = string(video.get("id"))?;
    let snippet = video.get("snippet");
    let stats = video.get("statistics");

    Some(MediaItem {
        permalink: Some(format!("https://www.youtube.com/watch?v={}", id)),
        title: string(snippet.and_then(|s| s.get("title"))).unwrap_or_default(),
        thumbnail_url: thumbnail(snippet),
        published_at: string(snippet.and_then(|s| s.get("publishedAt"))),
        views: count(stats.and_then(|s| s.get("viewCount"))),
        likes: count(stats.and_then(|s| s.get("likeCount"))),
        comments: count(stats.and_then(|s| s.get("commentCount"))),
        id,
    })
}

#[async_trait]
impl ProviderConnector for YouTubeConnector {
    fn provider(&self) -> Provider {
        Provider::YouTube
    }

    fn authorize_url(&self, signed_state: &str) -> String {
        build_authorize_url(
            &self.endpoints.authorize_url,
            &[
                ("client_id", &self.credentials.client_id),
                ("redirect_uri", &self.credentials.redirect_uri),
                ("response_type", "code"),
                ("scope", SCOPE),
                ("access_type", "offline"),
                ("include_granted_scopes", "true"),
                ("prompt", "consent"),
                ("state", signed_state),
            ],
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenBundle, ProviderError> {
        debug!(provider = "youtube", "Exchanging authorization code");
        self.token_request(
            &[
                ("code", code),
                ("client_id", &self.credentials.client_id),
                ("client_secret", &self.credentials.client_secret),
                ("redirect_uri", &self.credentials.redirect_uri),
                ("grant_type", "authorization_code"),
            ],
            &[code, &self.credentials.client_secret],
        )
        .await
        .and_then(|token| self.bundle_from(token, None))
        .map_err(|e| e.into_provider_error("youtube token exchange", ProviderError::ExchangeFailed))
    }

    async fn fetch_profile(&self, bundle: &TokenBundle) -> Result<SocialAccountProfile, ProviderError> {
        let channels = self
            .api_get(
                "/youtube/v3/channels",
                &[("part", "snippet,statistics,contentDetails"), ("mine", "true")],
                bundle,
            )
            .await
            .map_err(|e| e.into_provider_error("youtube channel lookup", ProviderError::ProfileFetchFailed))?;

        let channel = channels.items.into_iter().next().ok_or_else(|| {
            ProviderError::ProfileFetchFailed("no YouTube channel on this account".to_string())
        })?;

        let snippet = channel.get("snippet");
        let stats = channel.get("statistics");
        let account_id = string(channel.get("id")).unwrap_or_default();

        let recent_media = match string(channel.pointer("/contentDetails/relatedPlaylists/uploads")) {
            Some(uploads) => match self.recent_videos(bundle, &uploads).await {
                Ok(videos) => videos,
                Err(e) => {
                    warn!(provider = "youtube", account_id = %account_id, error = ?e, "Recent videos unavailable");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        Ok(SocialAccountProfile {
            connected: true,
            username: string(snippet.and_then(|s| s.get("title"))).unwrap_or_default(),
            follower_count: count(stats.and_then(|s| s.get("subscriberCount"))),
            media_count: count(stats.and_then(|s| s.get("videoCount"))),
            last_updated_at: self.clock.now(),
            recent_media,
            details: ProviderDetails::YouTube {
                channel_thumbnail: thumbnail(snippet),
                view_count: count(stats.and_then(|s| s.get("viewCount"))),
            },
            account_id,
        })
    }

    async fn refresh(&self, bundle: &TokenBundle) -> Result<TokenBundle, ProviderError> {
        let refresh_token = bundle
            .refresh_token
            .as_deref()
            .ok_or_else(|| ProviderError::RefreshFailed("no refresh token stored".to_string()))?;

        self.token_request(
            &[
                ("client_id", &self.credentials.client_id),
                ("client_secret", &self.credentials.client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ],
            &bundle.secrets(),
        )
        .await
        .and_then(|token| self.bundle_from(token, Some(bundle)))
        .map_err(|e| e.into_provider_error("youtube token refresh", ProviderError::RefreshFailed))
    }
}
