//! Caller authentication for the connect step.
//!
//! The browser proves who it is with an identity assertion (an ID token from
//! the identity provider), sent either as `Authorization: Bearer <token>` or
//! as an `idToken` query parameter. The assertion is checked by an
//! [`IdentityVerifier`] and its subject must equal the `userId` the request
//! claims to act for.
//!
//! Callbacks are not authenticated here: the provider drives that request,
//! and the signed state carries the user instead.

mod identity;

pub use identity::IdentityToolkitVerifier;

use async_trait::async_trait;
use axum::http::HeaderMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;


/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
/// Returns the token string if present and valid.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let parts: Vec<&str> = header_value.splitn(2, ' ').collect();

    if parts.len() != 2 || !parts[0].eq_ignore_ascii_case("bearer") {
        return Err(TokenError::InvalidFormat);
    }

    let token = parts[1].trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Token extraction errors
#[derive(Debug, Error, PartialEq, Clone)]
pub enum TokenError {
    /// Authorization header not present
    #[error("Authorization token not provided")]
    Missing,
    /// Not "Bearer <token>"
    #[error("Invalid authorization token format")]
    InvalidFormat,
    #[error("Authorization token is empty")]
    Empty,
}

/// Caller identity failures.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum AuthError {
    /// No assertion, or the verifier rejected it
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    /// Valid assertion for a different user
    #[error("identity does not match the requested user")]
    IdentityMismatch,
}

/// Checks an identity assertion and returns its subject (the user id).
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, assertion: &str) -> Result<String, AuthError>;
}

/// Authenticates connect requests.
#[derive(Clone)]
pub struct RequestAuthenticator {
    verifier: Arc<dyn IdentityVerifier>,
    enabled: bool,
}

impl RequestAuthenticator {
    pub fn new(verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self {
            verifier,
            enabled: true,
        }
    }

    /// Authenticator that trusts the claimed user id (local development only).
    pub fn disabled(verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self {
            verifier,
            enabled: false,
        }
    }

    /// Verify the caller and return its user id.
    ///
    /// The header wins over the `idToken` query parameter when both are sent.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        id_token: Option<&str>,
        expected_user_id: &str,
    ) -> Result<String, AuthError> {
        if !self.enabled {
            return Ok(expected_user_id.to_string());
        }

        let assertion = match extract_bearer_token(headers) {
            Ok(token) => token,
            Err(TokenError::Missing) => id_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .ok_or_else(|| AuthError::Unauthenticated("no identity assertion".to_string()))?,
            Err(e) => return Err(AuthError::Unauthenticated(e.to_string())),
        };

        let subject = self.verifier.verify(&assertion).await?;
        if subject != expected_user_id {
            debug!(expected = %expected_user_id, "Identity assertion belongs to another user");
            return Err(AuthError::IdentityMismatch);
        }

        Ok(subject)
    }
}
