use axum::extract::{Extension, State};
use serde::Serialize;

use crate::app::AppState;
use crate::auth::AuthError;
use crate::database::models::User;
use crate::middleware::{ApiResponse, ApiResult, AuthUser};
use crate::services::usage_service::{Tier, UsageSummary};

#[derive(Debug, Serialize)]
pub struct WhoAmI {
    pub user: User,
    pub tier: Tier,
    pub usage: UsageSummary,
}

/// GET /api/auth/whoami - Current user, effective tier and this month's usage
///
/// ```json
/// {
///   "success": true,
///   "data": {
///     "user": { "id": "...", "email": "a@example.com", "display_name": null },
///     "tier": "free",
///     "usage": { "period_start": "...", "metrics": { "ai_generation": { "used": 1, "limit": 5, "remaining": 4 } } }
///   }
/// }
/// ```
pub async fn whoami(State(state): State<AppState>, Extension(auth): Extension<AuthUser>) -> ApiResult<WhoAmI> {
    let user = state
        .users
        .find_user(auth.user_id)
        .await
        .map_err(AuthError::from)?
        .ok_or(AuthError::UserNotFound)?;

    let usage = state.usage.summary(auth.user_id).await?;
    Ok(ApiResponse::success(WhoAmI {
        user,
        tier: usage.tier,
        usage,
    }))
}

/// DELETE /api/auth/session - Revoke the caller's session
pub async fn logout(State(state): State<AppState>, Extension(auth): Extension<AuthUser>) -> ApiResult<()> {
    state.users.logout(auth.session_id).await?;
    Ok(ApiResponse::no_content())
}
