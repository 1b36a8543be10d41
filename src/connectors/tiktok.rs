//! TikTok connector (Login Kit v2 + Display API).
//!
//! TikTok's payloads are not stable across sandbox and production apps: the
//! interesting fields may sit under a `data` envelope or at the top level,
//! and `error` is either a string or an object whose `code` is `"ok"` on
//! success. Every read here probes the known shapes before defaulting.

use super::http::{count, expiry_after, string, CallError, ProviderHttp};
use super::{
    build_authorize_url, Provider, ProviderConnector, ProviderEndpoints, ProviderError,
};
use crate::clock::Clock;
use crate::config::ProviderCredentials;
use crate::credentials::TokenBundle;
use crate::profiles::{MediaItem, ProviderDetails, SocialAccountProfile};
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub const AUTH_URL: &str = "https://www.tiktok.com/v2/auth/authorize/";
pub const TOKEN_URL: &str = "https://open.tiktokapis.com/v2/oauth/token/";
pub const BASE_URL: &str = "https://open.tiktokapis.com";
pub const SCOPES: &[&str] = &["user.info.basic", "user.info.stats", "video.list"];

const USER_FIELDS: &str =
    "open_id,union_id,avatar_url,display_name,username,follower_count,following_count,likes_count,video_count";
const VIDEO_FIELDS: &str =
    "id,title,video_description,cover_image_url,share_url,create_time,view_count,like_count,comment_count";

/// Access token lifetime when the response omits `expires_in` (seconds)
const DEFAULT_EXPIRES_IN: i64 = 86_400;

const RECENT_VIDEOS: usize = 6;

pub struct TikTokConnector {
    credentials: ProviderCredentials,
    endpoints: ProviderEndpoints,
    http: ProviderHttp,
    clock: Arc<dyn Clock>,
}

/// Error reported inside a 2xx TikTok payload, if any.
fn tiktok_error(json: &Value) -> Option<String> {
    match json.get("error") {
        Some(Value::String(code)) if !code.is_empty() => {
            let description = json
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Some(format!("{} {}", code, description).trim().to_string());
        }
        Some(Value::Object(obj)) => {
            let code = obj.get("code").and_then(Value::as_str).unwrap_or("ok");
            if code != "ok" {
                let message = obj.get("message").and_then(Value::as_str).unwrap_or_default();
                return Some(format!("{} {}", code, message).trim().to_string());
            }
        }
        _ => {}
    }

    // Legacy shape: {"data": {"error_code": 10008, "description": "..."}}
    let data = json.get("data")?;
    match data.get("error_code").and_then(Value::as_i64) {
        Some(0) | None => None,
        Some(code) => Some(format!(
            "error_code {} {}",
            code,
            data.get("description").and_then(Value::as_str).unwrap_or_default()
        )
        .trim()
        .to_string()),
    }
}

/// The object holding token fields: `data` when it carries them, else the root.
fn token_payload(json: &Value) -> &Value {
    match json.get("data") {
        Some(data) if data.get("access_token").is_some() => data,
        _ => json,
    }
}

/// The user object: `data.user`, then `data`, then `user`, then the root.
fn user_payload(json: &Value) -> Option<&Value> {
    let looks_like_user = |v: &&Value| {
        v.is_object()
            && ["open_id", "display_name", "username", "follower_count"]
                .iter()
                .any(|k| v.get(k).is_some())
    };
    [
        json.pointer("/data/user"),
        json.get("data"),
        json.get("user"),
        Some(json),
    ]
    .into_iter()
    .flatten()
    .find(looks_like_user)
}

/// The video array: `data.videos`, then `data.video_list`, then `videos`.
fn video_list(json: &Value) -> &[Value] {
    [
        json.pointer("/data/videos"),
        json.pointer("/data/video_list"),
        json.get("videos"),
    ]
    .into_iter()
    .flatten()
    .find_map(Value::as_array)
    .map(Vec::as_slice)
    .unwrap_or(&[])
}

fn video_item(video: &Value) -> Option<MediaItem> {
    let id = string(video.get("id"))?;
    let title = string(video.get("title"))
        .or_else(|| string(video.get("video_description")))
        .unwrap_or_default();
    let published_at = video
        .get("create_time")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.to_rfc3339());

    Some(MediaItem {
        id,
        title,
        thumbnail_url: string(video.get("cover_image_url")),
        permalink: string(video.get("share_url")),
        published_at,
        views: count(video.get("view_count")),
        likes: count(video.get("like_count")),
        comments: count(video.get("comment_count")),
    })
}

impl TikTokConnector {
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

    /// POST the token endpoint and turn the payload into a bundle.
    async fn token_request(
        &self,
        form: &[(&str, &str)],
        secrets: &[&str],
        previous: Option<&TokenBundle>,
    ) -> Result<TokenBundle, CallError> {
        let request = self
            .http
            .client()
            .post(&self.endpoints.token_url)
            .header("Cache-Control", "no-cache")
            .form(form);
        let json = self.http.send_json(request, secrets).await?;

        if let Some(err) = tiktok_error(&json) {
            return Err(CallError::Failed(err));
        }

        let payload = token_payload(&json);
        let access_token = string(payload.get("access_token"))
            .ok_or_else(|| CallError::Failed("response has no access_token".to_string()))?;
        let expires_in = payload
            .get("expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_EXPIRES_IN);
        let expires_at = expiry_after(self.clock.now(), expires_in)?;

        let mut extra = previous.map(|b| b.extra.clone()).unwrap_or_else(Map::new);
        for key in ["scope", "refresh_expires_in"] {
            if let Some(value) = payload.get(key) {
                extra.insert(key.to_string(), value.clone());
            }
        }

        Ok(TokenBundle {
            access_token,
            refresh_token: string(payload.get("refresh_token"))
                .or_else(|| previous.and_then(|b| b.refresh_token.clone())),
            expires_at,
            provider_account_id: string(payload.get("open_id"))
                .or_else(|| previous.map(|b| b.provider_account_id.clone()))
                .unwrap_or_default(),
            extra,
        })
    }

    async fn recent_videos(&self, bundle: &TokenBundle) -> Result<Vec<MediaItem>, CallError> {
        let request = self
            .http
            .client()
            .post(format!("{}/v2/video/list/", self.endpoints.api_base))
            .query(&[("fields", VIDEO_FIELDS)])
            .bearer_auth(&bundle.access_token)
            .json(&json!({ "max_count": RECENT_VIDEOS }));
        let json = self.http.send_json(request, &bundle.secrets()).await?;

        if let Some(err) = tiktok_error(&json) {
            return Err(CallError::Failed(err));
        }

        Ok(video_list(&json)
            .iter()
            .filter_map(video_item)
            .take(RECENT_VIDEOS)
            .collect())
    }
}

#[async_trait]
impl ProviderConnector for TikTokConnector {
    fn provider(&self) -> Provider {
        Provider::TikTok
    }

    fn authorize_url(&self, signed_state: &str) -> String {
        let scope = SCOPES.join(",");
        build_authorize_url(
            &self.endpoints.authorize_url,
            &[
                ("client_key", &self.credentials.client_id),
                ("scope", &scope),
                ("response_type", "code"),
                ("redirect_uri", &self.credentials.redirect_uri),
                ("state", signed_state),
            ],
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenBundle, ProviderError> {
        debug!(provider = "tiktok", "Exchanging authorization code");
        self.token_request(
            &[
                ("client_key", &self.credentials.client_id),
                ("client_secret", &self.credentials.client_secret),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", &self.credentials.redirect_uri),
            ],
            &[code, &self.credentials.client_secret],
            None,
        )
        .await
        .map_err(|e| e.into_provider_error("tiktok token exchange", ProviderError::ExchangeFailed))
    }

    async fn fetch_profile(&self, bundle: &TokenBundle) -> Result<SocialAccountProfile, ProviderError> {
        let fail = |e: CallError| e.into_provider_error("tiktok user info", ProviderError::ProfileFetchFailed);

        let request = self
            .http
            .client()
            .get(format!("{}/v2/user/info/", self.endpoints.api_base))
            .query(&[("fields", USER_FIELDS)])
            .bearer_auth(&bundle.access_token);
        let json = self.http.send_json(request, &bundle.secrets()).await.map_err(fail)?;

        if let Some(err) = tiktok_error(&json) {
            return Err(fail(CallError::Failed(err)));
        }

        let empty = Value::Object(Map::new());
        let user = user_payload(&json).unwrap_or(&empty);

        let account_id = string(user.get("open_id")).unwrap_or_else(|| bundle.provider_account_id.clone());
        let display_name = string(user.get("display_name")).unwrap_or_default();
        let username = string(user.get("username")).unwrap_or_else(|| display_name.clone());

        let recent_media = match self.recent_videos(bundle).await {
            Ok(videos) => videos,
            Err(e) => {
                warn!(provider = "tiktok", account_id = %account_id, error = ?e, "Recent videos unavailable");
                Vec::new()
            }
        };

        Ok(SocialAccountProfile {
            connected: true,
            account_id,
            username,
            follower_count: count(user.get("follower_count")),
            media_count: count(user.get("video_count")),
            last_updated_at: self.clock.now(),
            recent_media,
            details: ProviderDetails::TikTok {
                avatar_url: string(user.get("avatar_url")),
                display_name,
                following_count: count(user.get("following_count")),
                likes_count: count(user.get("likes_count")),
            },
        })
    }

    async fn refresh(&self, bundle: &TokenBundle) -> Result<TokenBundle, ProviderError> {
        let refresh_token = bundle
            .refresh_token
            .as_deref()
            .ok_or_else(|| ProviderError::RefreshFailed("no refresh token stored".to_string()))?;

        let mut secrets = bundle.secrets();
        secrets.push(&self.credentials.client_secret);

        self.token_request(
            &[
                ("client_key", &self.credentials.client_id),
                ("client_secret", &self.credentials.client_secret),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
            &secrets,
            Some(bundle),
        )
        .await
        .map_err(|e| e.into_provider_error("tiktok token refresh", ProviderError::RefreshFailed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use mockito::{Matcher, Server};

    fn credentials() -> ProviderCredentials {
        ProviderCredentials {
            client_id: "tt-key".to_string(),
            client_secret: "tt-secret".to_string(),
            redirect_uri: "http://localhost:3000/tiktok_callback".to_string(),
        }
    }

    fn connector(server_url: &str, clock: &ManualClock) -> TikTokConnector {
        TikTokConnector::new(credentials(), reqwest::Client::new(), Arc::new(clock.clone()))
            .with_endpoints(ProviderEndpoints::local(server_url))
    }

    fn bundle(clock: &ManualClock) -> TokenBundle {
        TokenBundle {
            access_token: "act.token".to_string(),
            refresh_token: Some("rft.token".to_string()),
            expires_at: clock.now() + Duration::hours(24),
            provider_account_id: "open-1".to_string(),
            extra: Map::new(),
        }
    }

    #[test]
    fn test_authorize_url_uses_client_key() {
        let clock = ManualClock::at_epoch(1_700_000_000);
        let url = TikTokConnector::new(credentials(), reqwest::Client::new(), Arc::new(clock))
            .authorize_url("u1:1700000000:sig");

        assert!(url.starts_with(AUTH_URL));
        assert!(url.contains("client_key=tt-key"));
        assert!(!url.contains("client_id="));
        assert!(url.contains("scope=user.info.basic%2Cuser.info.stats%2Cvideo.list"));
        assert!(url.contains("state=u1%3A1700000000%3Asig"));
    }

    #[test]
    fn test_envelope_probing() {
        let enveloped = json!({"data": {"user": {"open_id": "a", "follower_count": 5}}, "error": {"code": "ok"}});
        assert_eq!(user_payload(&enveloped).unwrap()["open_id"], "a");

        let flat = json!({"data": {"open_id": "b", "display_name": "B"}});
        assert_eq!(user_payload(&flat).unwrap()["open_id"], "b");

        let top = json!({"open_id": "c", "username": "cc"});
        assert_eq!(user_payload(&top).unwrap()["open_id"], "c");

        assert!(user_payload(&json!({"data": {}})).is_none());

        assert_eq!(video_list(&json!({"data": {"video_list": [{"id": "1"}]}})).len(), 1);
        assert_eq!(video_list(&json!({"videos": [{"id": "1"}, {"id": "2"}]})).len(), 2);
        assert!(video_list(&json!({"data": {"cursor": 0}})).is_empty());
    }

    #[test]
    fn test_error_shapes() {
        assert_eq!(tiktok_error(&json!({"error": {"code": "ok", "message": ""}})), None);
        assert_eq!(
            tiktok_error(&json!({"error": "invalid_grant", "error_description": "Authorization code is expired."})),
            Some("invalid_grant Authorization code is expired.".to_string())
        );
        assert_eq!(
            tiktok_error(&json!({"error": {"code": "access_token_invalid", "message": "expired"}})),
            Some("access_token_invalid expired".to_string())
        );
        assert!(tiktok_error(&json!({"data": {"error_code": 10008, "description": "bad"}})).is_some());
        assert_eq!(tiktok_error(&json!({"data": {"error_code": 0}})), None);
    }

    #[tokio::test]
    async fn test_exchange_code_flat_response() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("client_key".into(), "tt-key".into()))
            .with_status(200)
            .with_body(
                r#"{"access_token":"act.1","expires_in":86400,"open_id":"open-1",
                    "refresh_token":"rft.1","refresh_expires_in":31536000,"scope":"user.info.basic","token_type":"Bearer"}"#,
            )
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_000);
        let bundle = connector(&server.url(), &clock).exchange_code("code-1").await.unwrap();

        assert_eq!(bundle.access_token, "act.1");
        assert_eq!(bundle.refresh_token.as_deref(), Some("rft.1"));
        assert_eq!(bundle.provider_account_id, "open-1");
        assert_eq!(bundle.expires_at.timestamp(), 1_700_000_000 + 86_400);
        assert_eq!(bundle.extra["refresh_expires_in"], 31_536_000);
    }

    #[tokio::test]
    async fn test_exchange_code_rejects_out_of_range_expiry() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"a","expires_in":9000000000000000,"open_id":"open-1","refresh_token":"r"}"#)
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_000);
        let err = connector(&server.url(), &clock).exchange_code("code").await.unwrap_err();

        assert!(matches!(err, ProviderError::ExchangeFailed(ref m) if m.contains("expires_in")));
    }

    #[tokio::test]
    async fn test_exchange_code_enveloped_response_without_expiry() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"data":{"access_token":"act.2","open_id":"open-2"},"message":"success"}"#)
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_000);
        let bundle = connector(&server.url(), &clock).exchange_code("code-2").await.unwrap();

        assert_eq!(bundle.access_token, "act.2");
        assert!(bundle.refresh_token.is_none());
        assert_eq!(bundle.expires_at.timestamp(), 1_700_000_000 + DEFAULT_EXPIRES_IN);
    }

    #[tokio::test]
    async fn test_exchange_error_in_ok_response() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"error":"invalid_grant","error_description":"Authorization code is expired.","log_id":"x"}"#)
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_000);
        let err = connector(&server.url(), &clock).exchange_code("old-code").await.unwrap_err();

        match err {
            ProviderError::ExchangeFailed(msg) => assert!(msg.contains("Authorization code is expired.")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_profile_enveloped() {
        let mut server = Server::new_async().await;
        let _user = server
            .mock("GET", "/v2/user/info/")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer act.token")
            .with_status(200)
            .with_body(
                r#"{"data":{"user":{"open_id":"open-1","display_name":"Dancer","avatar_url":"https://tt.example/a.jpg",
                    "follower_count":1500,"following_count":12,"likes_count":9000,"video_count":33}},
                    "error":{"code":"ok","message":"","log_id":"1"}}"#,
            )
            .create_async()
            .await;
        let _videos = server
            .mock("POST", "/v2/video/list/")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJsonString(r#"{"max_count":6}"#.to_string()))
            .with_status(200)
            .with_body(
                r#"{"data":{"videos":[{"id":"7001","title":"clip","create_time":1700000000,
                    "view_count":100,"like_count":10,"comment_count":2,"share_url":"https://tt.example/v/7001"}],
                    "cursor":0,"has_more":false},"error":{"code":"ok"}}"#,
            )
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_500);
        let profile = connector(&server.url(), &clock).fetch_profile(&bundle(&clock)).await.unwrap();

        assert!(profile.connected);
        assert_eq!(profile.account_id, "open-1");
        // No username field: falls back to the display name
        assert_eq!(profile.username, "Dancer");
        assert_eq!(profile.follower_count, 1500);
        assert_eq!(profile.media_count, 33);
        assert_eq!(
            profile.details,
            ProviderDetails::TikTok {
                avatar_url: Some("https://tt.example/a.jpg".to_string()),
                display_name: "Dancer".to_string(),
                following_count: 12,
                likes_count: 9000,
            }
        );
        assert_eq!(profile.recent_media.len(), 1);
        assert_eq!(profile.recent_media[0].views, 100);
        assert_eq!(
            profile.recent_media[0].published_at.as_deref(),
            Some("2023-11-14T22:13:20+00:00")
        );
    }

    #[tokio::test]
    async fn test_fetch_profile_with_missing_fields() {
        let mut server = Server::new_async().await;
        let _user = server
            .mock("GET", "/v2/user/info/")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data":{},"error":{"code":"ok"}}"#)
            .create_async()
            .await;
        let _videos = server
            .mock("POST", "/v2/video/list/")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(r#"{"error":{"code":"scope_not_authorized","message":"video.list"}}"#)
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_000);
        let profile = connector(&server.url(), &clock).fetch_profile(&bundle(&clock)).await.unwrap();

        assert_eq!(profile.account_id, "open-1");
        assert_eq!(profile.username, "");
        assert_eq!(profile.follower_count, 0);
        assert_eq!(profile.media_count, 0);
        assert!(profile.recent_media.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_rotates_refresh_token() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), "rft.token".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"act.new","refresh_token":"rft.new","expires_in":86400,"open_id":"open-1"}"#)
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_000);
        let fresh = connector(&server.url(), &clock).refresh(&bundle(&clock)).await.unwrap();

        assert_eq!(fresh.access_token, "act.new");
        assert_eq!(fresh.refresh_token.as_deref(), Some("rft.new"));
        assert_eq!(fresh.provider_account_id, "open-1");
    }

    #[tokio::test]
    async fn test_refresh_rejected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"error":"invalid_grant","error_description":"Refresh token is invalid or expired."}"#)
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_000);
        let err = connector(&server.url(), &clock).refresh(&bundle(&clock)).await.unwrap_err();
        assert!(matches!(err, ProviderError::RefreshFailed(_)));
    }
}
