//! HTTP API.
//!
//! - `GET /{provider}_connect`: authenticate, sign state, redirect to provider
//! - `GET /{provider}_callback`: verify state, exchange code, persist
//! - `GET /profiles/:user_id`: the caller's connection summaries
//! - `GET /health`
//!
//! Provider routes exist only for providers with configured credentials.

pub mod oauth;
mod pages;
pub mod profiles;

use crate::auth::{AuthError, RequestAuthenticator};
use crate::connectors::ConnectorRegistry;
use crate::credentials::CredentialStore;
use crate::profiles::ProfileStore;
use crate::signer::StateSigner;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub signer: Arc<StateSigner>,
    pub authenticator: RequestAuthenticator,
    pub connectors: ConnectorRegistry,
    pub credentials: Arc<CredentialStore>,
    pub profiles: Arc<ProfileStore>,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types for JSON endpoints
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthenticated(_) => AppError::Unauthorized(err.to_string()),
            AuthError::IdentityMismatch => AppError::Forbidden(err.to_string()),
        }
    }
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/profiles/:user_id", get(profiles::get_profiles));

    for provider in state.connectors.providers() {
        router = router
            .route(
                &format!("/{}_connect", provider),
                get(
                    move |state: State<Arc<AppState>>,
                          params: Query<oauth::ConnectParams>,
                          headers: HeaderMap| {
                        oauth::connect(provider, state, params, headers)
                    },
                ),
            )
            .route(
                &format!("/{}_callback", provider),
                get(
                    move |state: State<Arc<AppState>>, params: Query<oauth::CallbackParams>| {
                        oauth::callback(provider, state, params)
                    },
                ),
            );
    }

    router.with_state(Arc::new(state))
}

async fn health() -> &'static str {
    "ok"
}
