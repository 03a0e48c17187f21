use axum::extract::{Extension, State};

use crate::app::AppState;
use crate::middleware::{ApiResponse, ApiResult, AuthUser};
use crate::services::usage_service::UsageSummary;

/// GET /api/usage - Per-metric usage and limits for the current period
pub async fn usage_get(State(state): State<AppState>, Extension(auth): Extension<AuthUser>) -> ApiResult<UsageSummary> {
    Ok(ApiResponse::success(state.usage.summary(auth.user_id).await?))
}
