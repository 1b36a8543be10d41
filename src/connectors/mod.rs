//! Provider connectors.
//!
//! Each supported platform implements [`ProviderConnector`], which walks one
//! connection through its OAuth lifecycle:
//!
//! ```text
//! Unconnected
//!   → authorize_url(state)        (no network)
//!   → exchange_code(code)         TokenBundle
//!   → fetch_profile(bundle)       SocialAccountProfile
//!   → persisted by the caller
//!
//! later, from the batch job:
//!   assess(bundle, now) → refresh(bundle) → fetch_profile(bundle)
//! ```
//!
//! Connectors own the parsing quirks of their provider and never persist
//! anything themselves.

mod http;
pub mod instagram;
mod registry;
pub mod tiktok;
pub mod youtube;

pub use http::{build_http_client, redact, ProviderHttp};
pub use instagram::InstagramConnector;
pub use registry::ConnectorRegistry;
pub use tiktok::TikTokConnector;
pub use youtube::YouTubeConnector;

use crate::credentials::TokenBundle;
use crate::profiles::SocialAccountProfile;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Refresh a token this close to expiry (seconds)
pub const REFRESH_MARGIN_SECONDS: i64 = 90;

/// Supported platforms
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    YouTube,
    TikTok,
    Instagram,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::YouTube, Provider::TikTok, Provider::Instagram];

    /// Name used in routes, storage and config keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::YouTube => "youtube",
            Provider::TikTok => "tiktok",
            Provider::Instagram => "instagram",
        }
    }

    /// Human-readable name for pages.
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::YouTube => "YouTube",
            Provider::TikTok => "TikTok",
            Provider::Instagram => "Instagram",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "youtube" => Ok(Provider::YouTube),
            "tiktok" => Ok(Provider::TikTok),
            "instagram" => Ok(Provider::Instagram),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown provider '{0}'")]
pub struct UnknownProvider(pub String);

/// Provider interaction failures.
///
/// Messages carry the provider's error detail for server-side logs. Token
/// strings are scrubbed before a message is built.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ProviderError {
    #[error("token exchange failed: {0}")]
    ExchangeFailed(String),
    /// Provider rejected the refresh; terminal until the user reconnects
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("no linked account: {0}")]
    NoLinkedAccount(String),
    #[error("profile fetch failed: {0}")]
    ProfileFetchFailed(String),
    #[error("{0} timed out")]
    Timeout(String),
}

/// What a stored bundle needs before it can be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenState {
    /// Usable as-is
    Current,
    /// Expired or about to; `refresh` can renew it
    NeedsRefresh,
    /// Expired and cannot be renewed without the user
    Expired,
}

/// One platform's OAuth and profile API.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    fn provider(&self) -> Provider;

    /// Authorization endpoint URL carrying client id, redirect URI, scopes,
    /// `response_type=code` and the signed state. No network call.
    fn authorize_url(&self, signed_state: &str) -> String;

    /// Convert an authorization code into a token bundle.
    async fn exchange_code(&self, code: &str) -> Result<TokenBundle, ProviderError>;

    /// Fetch identity and counters. Recent media is best-effort: a failing
    /// listing leaves `recent_media` empty instead of failing the call.
    async fn fetch_profile(&self, bundle: &TokenBundle) -> Result<SocialAccountProfile, ProviderError>;

    /// Obtain a fresh access token.
    async fn refresh(&self, bundle: &TokenBundle) -> Result<TokenBundle, ProviderError>;

    /// Record the account the profile belongs to on a freshly exchanged bundle.
    fn bind_account(&self, bundle: &mut TokenBundle, profile: &SocialAccountProfile) {
        bundle.provider_account_id = profile.account_id.clone();
    }

    /// Decide whether `bundle` is usable at `now`.
    fn assess(&self, bundle: &TokenBundle, now: DateTime<Utc>) -> TokenState {
        if bundle.expires_at > now + Duration::seconds(REFRESH_MARGIN_SECONDS) {
            TokenState::Current
        } else if bundle.refresh_token.is_some() {
            TokenState::NeedsRefresh
        } else {
            TokenState::Expired
        }
    }
}

/// Where a connector sends its requests. Tests point these at a mock server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    pub api_base: String,
}

impl ProviderEndpoints {
    /// All three endpoints under one base URL.
    pub fn local(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            authorize_url: format!("{}/authorize", base),
            token_url: format!("{}/token", base),
            api_base: base.to_string(),
        }
    }
}

/// Build an authorization URL from ordered query pairs.
pub(crate) fn build_authorize_url(base: &str, params: &[(&str, &str)]) -> String {
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", base, query)
}
