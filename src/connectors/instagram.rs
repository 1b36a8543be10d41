//! Instagram connector (Facebook Login + Graph API).
//!
//! Instagram business accounts are reached through the Facebook page they
//! are linked to. Tokens have a fixed lifetime and no refresh token: the
//! short-lived token from the code exchange is upgraded to a long-lived one
//! (about 60 days) and "refresh" re-extends a token that is still valid.

use super::http::{count, decode, expiry_after, provider_error_message, string, CallError, ProviderHttp};
use super::{
    build_authorize_url, Provider, ProviderConnector, ProviderEndpoints, ProviderError, TokenState,
};
use crate::clock::Clock;
use crate::config::ProviderCredentials;
use crate::credentials::TokenBundle;
use crate::profiles::{MediaItem, ProviderDetails, SocialAccountProfile};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const AUTH_URL: &str = "https://www.facebook.com/v19.0/dialog/oauth";
pub const TOKEN_URL: &str = "https://graph.facebook.com/v19.0/oauth/access_token";
pub const BASE_URL: &str = "https://graph.facebook.com/v19.0";
pub const SCOPES: &[&str] = &["instagram_basic", "pages_show_list"];

/// Long-lived token lifetime when the response omits `expires_in` (60 days)
const LONG_LIVED_EXPIRES_IN: i64 = 60 * 24 * 3600;

/// Re-extend long-lived tokens this close to expiry
const EXTEND_WINDOW_DAYS: i64 = 7;

const RECENT_MEDIA: usize = 6;

const PROFILE_FIELDS: &str = "id,username,followers_count,media_count,profile_picture_url";
const MEDIA_FIELDS: &str =
    "id,caption,media_type,media_url,thumbnail_url,permalink,timestamp,like_count,comments_count";

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PageList {
    data: Vec<Page>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Page {
    id: String,
    name: String,
    instagram_business_account: Option<BusinessAccount>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct BusinessAccount {
    id: String,
}

/// Business account behind the user's first linked page.
struct LinkedAccount {
    page_id: Option<String>,
    instagram_id: String,
}

pub struct InstagramConnector {
    credentials: ProviderCredentials,
    endpoints: ProviderEndpoints,
    http: ProviderHttp,
    clock: Arc<dyn Clock>,
}

impl InstagramConnector {
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

    async fn graph_get(&self, url: String, query: &[(&str, &str)], secrets: &[&str]) -> Result<Value, CallError> {
        let request = self.http.client().get(url).query(query);
        let json = self.http.send_json(request, secrets).await?;
        // Graph occasionally reports errors with a 200
        if json.get("error").is_some() {
            if let Some(message) = provider_error_message(&json) {
                return Err(CallError::Failed(message));
            }
        }
        Ok(json)
    }

    async fn token_request(&self, query: &[(&str, &str)], secrets: &[&str]) -> Result<(String, Option<i64>), CallError> {
        let json = self.graph_get(self.endpoints.token_url.clone(), query, secrets).await?;
        let token: TokenResponse = decode(json)?;
        match token.access_token {
            Some(access_token) if !access_token.is_empty() => Ok((access_token, token.expires_in)),
            _ => Err(CallError::Failed("response has no access_token".to_string())),
        }
    }

    /// Swap a valid token for a long-lived one.
    async fn long_lived(&self, token: &str) -> Result<TokenBundle, CallError> {
        let (access_token, expires_in) = self
            .token_request(
                &[
                    ("grant_type", "fb_exchange_token"),
                    ("client_id", &self.credentials.client_id),
                    ("client_secret", &self.credentials.client_secret),
                    ("fb_exchange_token", token),
                ],
                &[token, &self.credentials.client_secret],
            )
            .await?;
        let expires_at = expiry_after(self.clock.now(), expires_in.unwrap_or(LONG_LIVED_EXPIRES_IN))?;

        Ok(TokenBundle {
            access_token,
            refresh_token: None,
            expires_at,
            provider_account_id: String::new(),
            extra: Map::new(),
        })
    }

    /// Find the Instagram business account linked to one of the user's pages.
    async fn linked_account(&self, bundle: &TokenBundle) -> Result<LinkedAccount, ProviderError> {
        let json = self
            .graph_get(
                format!("{}/me/accounts", self.endpoints.api_base),
                &[
                    ("fields", "id,name,instagram_business_account"),
                    ("access_token", &bundle.access_token),
                ],
                &bundle.secrets(),
            )
            .await
            .map_err(|e| e.into_provider_error("instagram page lookup", ProviderError::ProfileFetchFailed))?;

        let pages: PageList = decode(json)
            .map_err(|e| e.into_provider_error("instagram page lookup", ProviderError::ProfileFetchFailed))?;

        pages
            .data
            .into_iter()
            .find_map(|page| {
                let account = page.instagram_business_account.filter(|a| !a.id.is_empty())?;
                debug!(page_id = %page.id, page_name = %page.name, "Found linked Instagram account");
                Some(LinkedAccount {
                    page_id: Some(page.id).filter(|id| !id.is_empty()),
                    instagram_id: account.id,
                })
            })
            .ok_or_else(|| {
                ProviderError::NoLinkedAccount(
                    "no Facebook page with a linked Instagram business account".to_string(),
                )
            })
    }

    async fn recent_media(&self, bundle: &TokenBundle, instagram_id: &str) -> Result<Vec<MediaItem>, CallError> {
        let limit = RECENT_MEDIA.to_string();
        let json = self
            .graph_get(
                format!("{}/{}/media", self.endpoints.api_base, instagram_id),
                &[
                    ("fields", MEDIA_FIELDS),
                    ("limit", &limit),
                    ("access_token", &bundle.access_token),
                ],
                &bundle.secrets(),
            )
            .await?;

        Ok(json
            .get("data")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(media_item).take(RECENT_MEDIA).collect())
            .unwrap_or_default())
    }
}

fn media_item(media: &Value) -> Option<MediaItem> {
    let id = string(media.get("id"))?;
    // Videos expose a thumbnail; images only a media_url
    let thumbnail_url = string(media.get("thumbnail_url")).or_else(|| string(media.get("media_url")));

    Some(MediaItem {
        id,
        title: string(media.get("caption")).unwrap_or_default(),
        thumbnail_url,
        permalink: string(media.get("permalink")),
        published_at: string(media.get("timestamp")),
        views: 0,
        likes: count(media.get("like_count")),
        comments: count(media.get("comments_count")),
    })
}

#[async_trait]
impl ProviderConnector for InstagramConnector {
    fn provider(&self) -> Provider {
        Provider::Instagram
    }

    fn authorize_url(&self, signed_state: &str) -> String {
        let scope = SCOPES.join(",");
        build_authorize_url(
            &self.endpoints.authorize_url,
            &[
                ("client_id", &self.credentials.client_id),
                ("redirect_uri", &self.credentials.redirect_uri),
                ("scope", &scope),
                ("response_type", "code"),
                ("state", signed_state),
            ],
        )
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenBundle, ProviderError> {
        debug!(provider = "instagram", "Exchanging authorization code");
        let fail = |e: CallError| e.into_provider_error("instagram token exchange", ProviderError::ExchangeFailed);

        let (short_lived, _) = self
            .token_request(
                &[
                    ("client_id", &self.credentials.client_id),
                    ("redirect_uri", &self.credentials.redirect_uri),
                    ("client_secret", &self.credentials.client_secret),
                    ("code", code),
                ],
                &[code, &self.credentials.client_secret],
            )
            .await
            .map_err(fail)?;

        self.long_lived(&short_lived).await.map_err(fail)
    }

    async fn fetch_profile(&self, bundle: &TokenBundle) -> Result<SocialAccountProfile, ProviderError> {
        let linked = if bundle.provider_account_id.is_empty() {
            self.linked_account(bundle).await?
        } else {
            LinkedAccount {
                page_id: bundle.extra_str("page_id").map(str::to_string),
                instagram_id: bundle.provider_account_id.clone(),
            }
        };

        let json = self
            .graph_get(
                format!("{}/{}", self.endpoints.api_base, linked.instagram_id),
                &[("fields", PROFILE_FIELDS), ("access_token", &bundle.access_token)],
                &bundle.secrets(),
            )
            .await
            .map_err(|e| e.into_provider_error("instagram profile", ProviderError::ProfileFetchFailed))?;

        let recent_media = match self.recent_media(bundle, &linked.instagram_id).await {
            Ok(media) => media,
            Err(e) => {
                warn!(provider = "instagram", account_id = %linked.instagram_id, error = ?e, "Recent media unavailable");
                Vec::new()
            }
        };

        Ok(SocialAccountProfile {
            connected: true,
            account_id: string(json.get("id")).unwrap_or(linked.instagram_id),
            username: string(json.get("username")).unwrap_or_default(),
            follower_count: count(json.get("followers_count")),
            media_count: count(json.get("media_count")),
            last_updated_at: self.clock.now(),
            recent_media,
            details: ProviderDetails::Instagram {
                page_id: linked.page_id,
                profile_picture_url: string(json.get("profile_picture_url")),
            },
        })
    }

    async fn refresh(&self, bundle: &TokenBundle) -> Result<TokenBundle, ProviderError> {
        if bundle.expires_at <= self.clock.now() {
            return Err(ProviderError::RefreshFailed(
                "long-lived token has expired; the user must reconnect".to_string(),
            ));
        }

        let extended = self
            .long_lived(&bundle.access_token)
            .await
            .map_err(|e| e.into_provider_error("instagram token extension", ProviderError::RefreshFailed))?;

        info!(provider = "instagram", account_id = %bundle.provider_account_id, "Extended long-lived token");

        Ok(TokenBundle {
            provider_account_id: bundle.provider_account_id.clone(),
            extra: bundle.extra.clone(),
            ..extended
        })
    }

    fn bind_account(&self, bundle: &mut TokenBundle, profile: &SocialAccountProfile) {
        bundle.provider_account_id = profile.account_id.clone();
        if let ProviderDetails::Instagram { page_id: Some(page_id), .. } = &profile.details {
            bundle.extra.insert("page_id".to_string(), Value::String(page_id.clone()));
        }
    }

    fn assess(&self, bundle: &TokenBundle, now: DateTime<Utc>) -> TokenState {
        if bundle.expires_at <= now {
            TokenState::Expired
        } else if bundle.expires_at - now <= Duration::days(EXTEND_WINDOW_DAYS) {
            TokenState::NeedsRefresh
        } else {
            TokenState::Current
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use mockito::{Matcher, Server};

    fn credentials() -> ProviderCredentials {
        ProviderCredentials {
            client_id: "fb-app".to_string(),
            client_secret: "fb-secret".to_string(),
            redirect_uri: "http://localhost:3000/instagram_callback".to_string(),
        }
    }

    fn connector(server_url: &str, clock: &ManualClock) -> InstagramConnector {
        InstagramConnector::new(credentials(), reqwest::Client::new(), Arc::new(clock.clone()))
            .with_endpoints(ProviderEndpoints::local(server_url))
    }

    fn bundle(clock: &ManualClock, account_id: &str) -> TokenBundle {
        TokenBundle {
            access_token: "EAAlong".to_string(),
            refresh_token: None,
            expires_at: clock.now() + Duration::days(50),
            provider_account_id: account_id.to_string(),
            extra: Map::new(),
        }
    }

    #[test]
    fn test_authorize_url() {
        let clock = ManualClock::at_epoch(1_700_000_000);
        let url = InstagramConnector::new(credentials(), reqwest::Client::new(), Arc::new(clock))
            .authorize_url("u1:1700000000:sig");

        assert!(url.starts_with(AUTH_URL));
        assert!(url.contains("client_id=fb-app"));
        assert!(url.contains("scope=instagram_basic%2Cpages_show_list"));
        assert!(url.contains("response_type=code"));
    }

    #[tokio::test]
    async fn test_exchange_upgrades_to_long_lived_token() {
        let mut server = Server::new_async().await;
        let _short = server
            .mock("GET", "/token")
            .match_query(Matcher::UrlEncoded("code".into(), "fb-code".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"EAAshort","token_type":"bearer","expires_in":5183}"#)
            .create_async()
            .await;
        let _long = server
            .mock("GET", "/token")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "fb_exchange_token".into()),
                Matcher::UrlEncoded("fb_exchange_token".into(), "EAAshort".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"EAAlong","token_type":"bearer"}"#)
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_000);
        let bundle = connector(&server.url(), &clock).exchange_code("fb-code").await.unwrap();

        assert_eq!(bundle.access_token, "EAAlong");
        assert!(bundle.refresh_token.is_none());
        assert_eq!(bundle.expires_at.timestamp(), 1_700_000_000 + LONG_LIVED_EXPIRES_IN);
    }

    #[tokio::test]
    async fn test_exchange_rejects_out_of_range_expiry() {
        let mut server = Server::new_async().await;
        let _short = server
            .mock("GET", "/token")
            .match_query(Matcher::UrlEncoded("code".into(), "fb-code".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"EAAshort","expires_in":5183}"#)
            .create_async()
            .await;
        let _long = server
            .mock("GET", "/token")
            .match_query(Matcher::UrlEncoded("grant_type".into(), "fb_exchange_token".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"EAAlong","expires_in":9000000000000000}"#)
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_000);
        let err = connector(&server.url(), &clock).exchange_code("fb-code").await.unwrap_err();

        assert!(matches!(err, ProviderError::ExchangeFailed(ref m) if m.contains("expires_in")));
    }

    #[tokio::test]
    async fn test_exchange_error_is_redacted() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/token")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(
                r#"{"error":{"message":"This authorization code has expired. code=fb-code","type":"OAuthException","code":100}}"#,
            )
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_000);
        let err = connector(&server.url(), &clock).exchange_code("fb-code").await.unwrap_err();

        match err {
            ProviderError::ExchangeFailed(msg) => {
                assert!(msg.contains("has expired"));
                assert!(!msg.contains("fb-code"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_profile_resolves_linked_page() {
        let mut server = Server::new_async().await;
        let _pages = server
            .mock("GET", "/me/accounts")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"data":[
                    {"id":"p0","name":"Unlinked page"},
                    {"id":"p1","name":"Shop","instagram_business_account":{"id":"ig1"}}
                ]}"#,
            )
            .create_async()
            .await;
        let _profile = server
            .mock("GET", "/ig1")
            .match_query(Matcher::UrlEncoded("access_token".into(), "EAAlong".into()))
            .with_status(200)
            .with_body(
                r#"{"id":"ig1","username":"shop.ig","followers_count":320,"media_count":18,
                    "profile_picture_url":"https://ig.example/p.jpg"}"#,
            )
            .create_async()
            .await;
        let _media = server
            .mock("GET", "/ig1/media")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"data":[{"id":"m1","caption":"new drop","media_type":"IMAGE","media_url":"https://ig.example/m1.jpg",
                    "permalink":"https://instagram.com/p/m1","timestamp":"2024-02-01T10:00:00+0000","like_count":40,"comments_count":4}]}"#,
            )
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_000);
        let ig = connector(&server.url(), &clock);
        let mut fresh = bundle(&clock, "");
        let profile = ig.fetch_profile(&fresh).await.unwrap();

        assert!(profile.connected);
        assert_eq!(profile.account_id, "ig1");
        assert_eq!(profile.username, "shop.ig");
        assert_eq!(profile.follower_count, 320);
        assert_eq!(profile.media_count, 18);
        assert_eq!(
            profile.details,
            ProviderDetails::Instagram {
                page_id: Some("p1".to_string()),
                profile_picture_url: Some("https://ig.example/p.jpg".to_string()),
            }
        );
        assert_eq!(profile.recent_media[0].thumbnail_url.as_deref(), Some("https://ig.example/m1.jpg"));
        assert_eq!(profile.recent_media[0].likes, 40);

        ig.bind_account(&mut fresh, &profile);
        assert_eq!(fresh.provider_account_id, "ig1");
        assert_eq!(fresh.extra_str("page_id"), Some("p1"));
    }

    #[tokio::test]
    async fn test_no_linked_account() {
        let mut server = Server::new_async().await;
        let _pages = server
            .mock("GET", "/me/accounts")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"data":[{"id":"p0","name":"Personal page"}]}"#)
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_000);
        let err = connector(&server.url(), &clock)
            .fetch_profile(&bundle(&clock, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NoLinkedAccount(_)));
    }

    #[tokio::test]
    async fn test_known_account_skips_page_lookup() {
        let mut server = Server::new_async().await;
        let pages = server
            .mock("GET", "/me/accounts")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let _profile = server
            .mock("GET", "/ig9")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"id":"ig9","username":"known"}"#)
            .create_async()
            .await;
        let _media = server
            .mock("GET", "/ig9/media")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_000);
        let profile = connector(&server.url(), &clock)
            .fetch_profile(&bundle(&clock, "ig9"))
            .await
            .unwrap();

        assert_eq!(profile.username, "known");
        assert_eq!(profile.follower_count, 0);
        assert!(profile.recent_media.is_empty());
        pages.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_expired_token_is_terminal() {
        let clock = ManualClock::at_epoch(1_700_000_000);
        let mut expired = bundle(&clock, "ig1");
        expired.expires_at = clock.now() - Duration::hours(1);

        let err = connector("http://127.0.0.1:9", &clock).refresh(&expired).await.unwrap_err();
        assert!(matches!(err, ProviderError::RefreshFailed(_)));
    }

    #[tokio::test]
    async fn test_refresh_extends_valid_token() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/token")
            .match_query(Matcher::UrlEncoded("fb_exchange_token".into(), "EAAlong".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"EAAextended","expires_in":5184000}"#)
            .create_async()
            .await;

        let clock = ManualClock::at_epoch(1_700_000_000);
        let mut old = bundle(&clock, "ig1");
        old.extra.insert("page_id".to_string(), Value::String("p1".to_string()));

        let fresh = connector(&server.url(), &clock).refresh(&old).await.unwrap();
        assert_eq!(fresh.access_token, "EAAextended");
        assert_eq!(fresh.provider_account_id, "ig1");
        assert_eq!(fresh.extra_str("page_id"), Some("p1"));
        assert!(fresh.refresh_token.is_none());
    }

    #[test]
    fn test_assess_fixed_lifetime() {
        let clock = ManualClock::at_epoch(1_700_000_000);
        let ig = connector("http://127.0.0.1:9", &clock);
        let now = clock.now();
        let mut b = bundle(&clock, "ig1");

        assert_eq!(ig.assess(&b, now), TokenState::Current);

        b.expires_at = now + Duration::days(3);
        assert_eq!(ig.assess(&b, now), TokenState::NeedsRefresh);

        b.expires_at = now - Duration::seconds(1);
        assert_eq!(ig.assess(&b, now), TokenState::Expired);
    }
}
