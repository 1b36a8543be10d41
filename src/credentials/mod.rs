//! Private OAuth token storage.
//!
//! Token bundles live in their own SQLite database, separate from the
//! profile database that user-facing reads go through. Nothing in this
//! module is ever serialized into an HTTP response.
//!
//! # Usage
//!
//! ```no_run
//! use linkstat::connectors::Provider;
//! use linkstat::credentials::{CredentialStore, TokenBundle};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = CredentialStore::new("credentials.db")?;
//!
//! let bundle = TokenBundle {
//!     access_token: "ya29.access".to_string(),
//!     refresh_token: Some("1//refresh".to_string()),
//!     expires_at: Utc::now() + Duration::hours(1),
//!     provider_account_id: "UC123".to_string(),
//!     extra: Default::default(),
//! };
//! store.save("user1", Provider::YouTube, &bundle)?;
//!
//! if let Some(bundle) = store.get("user1", Provider::YouTube)? {
//!     println!("expires at {}", bundle.expires_at);
//! }
//!
//! store.delete("user1", Provider::YouTube)?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod storage;

pub use storage::CredentialStore;

/// Access/refresh credentials for one (user, provider) pair.
///
/// `Debug` output never contains the token strings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBundle {
    /// Bearer token for provider API calls
    pub access_token: String,

    /// Renewal token; absent for providers with fixed-lifetime tokens
    pub refresh_token: Option<String>,

    /// When the access token stops working (UTC)
    pub expires_at: DateTime<Utc>,

    /// The provider's id for the connected account (channel id, open id, ...)
    pub provider_account_id: String,

    /// Provider-specific values (granted scopes, linked page id, ...)
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl TokenBundle {
    /// Token strings, for scrubbing error messages.
    pub fn secrets(&self) -> Vec<&str> {
        let mut secrets = vec![self.access_token.as_str()];
        if let Some(refresh) = &self.refresh_token {
            secrets.push(refresh.as_str());
        }
        secrets
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

impl std::fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBundle")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("provider_account_id", &self.provider_account_id)
            .field("extra", &self.extra)
            .finish()
    }
}
