//! Profile read endpoint.

use super::{AppError, AppState};
use crate::connectors::Provider;
use crate::profiles::SocialAccountProfile;
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileQuery {
    id_token: Option<String>,
}

/// GET /profiles/:user_id
///
/// Provider → profile map for the authenticated owner. Tokens never appear.
pub async fn get_profiles(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<ProfileQuery>,
    headers: HeaderMap,
) -> Result<Json<BTreeMap<Provider, SocialAccountProfile>>, AppError> {
    state
        .authenticator
        .authenticate(&headers, query.id_token.as_deref(), &user_id)
        .await
        .map_err(|e| {
            warn!(user_id = %user_id, error = %e, "Profile read rejected");
            AppError::from(e)
        })?;

    let profiles = state.profiles.get_all(&user_id).map_err(|e| {
        error!(user_id = %user_id, error = %e, "Failed to load profiles");
        AppError::ServerError("Failed to load profiles".to_string())
    })?;

    Ok(Json(profiles))
}
