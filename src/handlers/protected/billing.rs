use axum::extract::{rejection::JsonRejection, Extension, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::middleware::{ApiResponse, ApiResult, AuthUser};
use crate::services::billing_service::SubscriptionView;

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub tier: String,
}

#[derive(Debug, Serialize)]
pub struct HostedPage {
    pub session_id: String,
    pub url: Option<String>,
}

/// POST /api/billing/checkout - Start a Stripe Checkout for `pro` or `team`
pub async fn checkout_post(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> ApiResult<HostedPage> {
    let Json(request) = payload?;
    let session = state
        .billing
        .checkout(auth.user_id, &auth.email, &request.tier)
        .await?;

    Ok(ApiResponse::created(HostedPage {
        session_id: session.id,
        url: session.url,
    }))
}

/// POST /api/billing/portal - Billing portal for the stored customer
pub async fn portal_post(State(state): State<AppState>, Extension(auth): Extension<AuthUser>) -> ApiResult<HostedPage> {
    let session = state.billing.portal(auth.user_id).await?;
    Ok(ApiResponse::created(HostedPage {
        session_id: session.id,
        url: session.url,
    }))
}

/// GET /api/billing/subscription
pub async fn subscription_get(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<SubscriptionView> {
    Ok(ApiResponse::success(state.billing.subscription(auth.user_id).await?))
}
