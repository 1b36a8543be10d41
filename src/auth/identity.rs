//! Identity assertion check against the Identity Toolkit `accounts:lookup` API.

use super::{AuthError, IdentityVerifier};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

#[derive(Deserialize, Default)]
#[serde(default)]
struct LookupResponse {
    users: Vec<LookupUser>,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
}

/// Resolves an ID token to its user id by asking the identity provider.
pub struct IdentityToolkitVerifier {
    client: reqwest::Client,
    lookup_url: String,
    api_key: String,
}

impl IdentityToolkitVerifier {
    pub fn new(client: reqwest::Client, lookup_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            lookup_url: lookup_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl IdentityVerifier for IdentityToolkitVerifier {
    async fn verify(&self, assertion: &str) -> Result<String, AuthError> {
        let response = self
            .client
            .post(&self.lookup_url)
            .query(&[("key", &self.api_key)])
            .json(&json!({ "idToken": assertion }))
            .send()
            .await
            .map_err(|e| {
                error!(timeout = e.is_timeout(), "Identity lookup request failed");
                AuthError::Unauthenticated("identity provider unavailable".to_string())
            })?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Identity assertion rejected");
            return Err(AuthError::Unauthenticated("invalid identity assertion".to_string()));
        }

        let lookup: LookupResponse = response.json().await.map_err(|e| {
            warn!(error = %e, "Unreadable identity lookup response");
            AuthError::Unauthenticated("invalid identity assertion".to_string())
        })?;

        lookup
            .users
            .into_iter()
            .map(|u| u.local_id)
            .find(|id| !id.is_empty())
            .ok_or_else(|| AuthError::Unauthenticated("identity assertion has no subject".to_string()))
    }
}
