//! OAuth 2.0 authorization flow for social account connections.
//!
//! Implements the authorization code flow:
//! 1. Client opens `/{provider}_connect?userId=...` with an identity assertion
//! 2. Caller is authenticated, a signed state is issued, 302 to the provider
//! 3. User authorizes on the provider's site
//! 4. Provider redirects to `/{provider}_callback?code=...&state=...`
//! 5. State is verified, code exchanged, profile fetched
//! 6. Token bundle and profile are stored; an HTML page notifies the opener
//!
//! The callback writes nothing unless every provider call succeeded.

use super::pages;
use super::{AppError, AppState};
use crate::connectors::{Provider, ProviderConnector};
use crate::credentials::TokenBundle;
use crate::profiles::SocialAccountProfile;
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Connect query parameters
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    user_id: Option<String>,
    id_token: Option<String>,
}

/// OAuth callback query parameters
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Callback failures, rendered as HTML for the popup window.
#[derive(Debug)]
enum CallbackError {
    /// Caller-side problem (denied consent, bad or expired state)
    BadRequest(&'static str),
    /// Provider or storage failure; details stay in the logs
    Failed,
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        match self {
            CallbackError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Html(pages::error_page(message))).into_response()
            }
            CallbackError::Failed => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(pages::error_page(
                    "We could not complete the connection. Please try again later.",
                )),
            )
                .into_response(),
        }
    }
}

/// GET /{provider}_connect
///
/// Redirects the authenticated caller to the provider's consent page.
pub async fn connect(
    provider: Provider,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let user_id = params
        .user_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing 'userId' parameter".to_string()))?;

    let connector = state.connectors.get(provider).ok_or_else(|| {
        AppError::NotFound(format!("Provider '{}' is not configured", provider))
    })?;

    state
        .authenticator
        .authenticate(&headers, params.id_token.as_deref(), &user_id)
        .await
        .map_err(|e| {
            warn!(provider = %provider, user_id = %user_id, error = %e, "Connect request rejected");
            AppError::from(e)
        })?;

    let signed_state = state
        .signer
        .sign(&user_id)
        .map_err(|e| AppError::BadRequest(format!("Invalid 'userId': {}", e)))?;

    let authorize_url = connector.authorize_url(&signed_state);

    info!(provider = %provider, user_id = %user_id, "Redirecting to provider");

    Ok((StatusCode::FOUND, [(header::LOCATION, authorize_url)]).into_response())
}

/// GET /{provider}_callback
///
/// Completes the flow started by [`connect`]. The signed state identifies
/// the user; no caller authentication happens here.
pub async fn callback(
    provider: Provider,
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    match complete_connection(provider, &state, params).await {
        Ok(profile) => Html(pages::success_page(provider, &profile)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn complete_connection(
    provider: Provider,
    state: &AppState,
    params: CallbackParams,
) -> Result<SocialAccountProfile, CallbackError> {
    if let Some(error) = params.error {
        warn!(
            provider = %provider,
            error = %error,
            description = params.error_description.as_deref().unwrap_or_default(),
            "Provider reported an authorization error"
        );
        return Err(CallbackError::BadRequest("The authorization was cancelled or denied."));
    }

    let code = params.code.filter(|c| !c.is_empty());
    let signed_state = params.state.filter(|s| !s.is_empty());
    let (Some(code), Some(signed_state)) = (code, signed_state) else {
        return Err(CallbackError::BadRequest("The authorization response is incomplete."));
    };

    let user_id = state.signer.verify(&signed_state).map_err(|e| {
        warn!(provider = %provider, error = %e, "Rejected OAuth state");
        CallbackError::BadRequest("This authorization link is invalid or has expired.")
    })?;

    debug!(provider = %provider, user_id = %user_id, "OAuth state verified");

    let connector = state.connectors.get(provider).ok_or_else(|| {
        error!(provider = %provider, "Callback for unregistered provider");
        CallbackError::Failed
    })?;

    let (bundle, profile) = fetch_connection(connector.as_ref(), &code).await.map_err(|e| {
        error!(provider = %provider, user_id = %user_id, error = %e, "OAuth connection failed");
        CallbackError::Failed
    })?;

    persist(state, &user_id, provider, &bundle, &profile).map_err(|e| {
        error!(provider = %provider, user_id = %user_id, error = %e, "Failed to store connection");
        CallbackError::Failed
    })?;

    info!(
        provider = %provider,
        user_id = %user_id,
        username = %profile.username,
        has_refresh_token = bundle.refresh_token.is_some(),
        "Account connected"
    );

    Ok(profile)
}

/// Exchange the code and fetch the profile. Nothing is stored.
async fn fetch_connection(
    connector: &dyn ProviderConnector,
    code: &str,
) -> Result<(TokenBundle, SocialAccountProfile), crate::connectors::ProviderError> {
    let mut bundle = connector.exchange_code(code).await?;
    let profile = connector.fetch_profile(&bundle).await?;
    connector.bind_account(&mut bundle, &profile);
    Ok((bundle, profile))
}

/// Store bundle then profile. A failed profile write restores the previous bundle.
fn persist(
    state: &AppState,
    user_id: &str,
    provider: Provider,
    bundle: &TokenBundle,
    profile: &SocialAccountProfile,
) -> Result<()> {
    let previous = state.credentials.get(user_id, provider)?;
    state.credentials.save(user_id, provider, bundle)?;

    if let Err(e) = state.profiles.save(user_id, provider, profile) {
        let rollback = match &previous {
            Some(old) => state.credentials.save(user_id, provider, old),
            None => state.credentials.delete(user_id, provider).map(|_| ()),
        };
        if let Err(rollback_err) = rollback {
            error!(provider = %provider, user_id = %user_id, error = %rollback_err, "Credential rollback failed");
        }
        return Err(e).context("Failed to store profile");
    }

    Ok(())
}
