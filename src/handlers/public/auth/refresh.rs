// handlers/public/auth/refresh.rs - POST /auth/refresh handler

use axum::{extract::State, http::HeaderMap, Json};
use serde::Deserialize;

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::auth::extract_jwt_from_headers;
use crate::middleware::{ApiResponse, ApiResult};
use crate::services::user_service::IssuedToken;

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    pub token: Option<String>,
}

/// POST /auth/refresh - Rotate a session
///
/// The token comes from the body (`{"token": ...}`) or the Authorization
/// header. It may be expired as long as it is inside the refresh window.
pub async fn refresh_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Option<Json<RefreshRequest>>,
) -> ApiResult<IssuedToken> {
    let from_body = payload.and_then(|Json(body)| body.token).filter(|t| !t.trim().is_empty());
    let token = match from_body {
        Some(token) => token,
        None => extract_jwt_from_headers(&headers).map_err(|_| ApiError::unauthorized("Missing token to refresh"))?,
    };

    let issued = state
        .users
        .refresh(token.trim(), super::user_agent(&headers))
        .await?;

    Ok(ApiResponse::success(issued))
}

