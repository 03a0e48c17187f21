// handlers/public/auth/register.rs - POST /auth/register handler

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;

use crate::app::AppState;
use crate::middleware::{ApiResponse, ApiResult};
use crate::services::user_service::IssuedToken;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

/// POST /auth/register - Create an account and start a session
///
/// Input: `{"email", "password", "display_name"?}`
/// Output (201): `{"token", "expires_at", "user"}`
pub async fn register_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<IssuedToken> {
    let Json(request) = payload?;

    let issued = state
        .users
        .register(
            &request.email,
            &request.password,
            request.display_name.as_deref(),
            super::user_agent(&headers),
        )
        .await?;

    Ok(ApiResponse::created(issued))
}
