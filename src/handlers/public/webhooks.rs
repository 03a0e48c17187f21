// handlers/public/webhooks.rs - POST /webhooks/stripe

use axum::{body::Bytes, extract::State, http::HeaderMap};

use crate::app::AppState;
use crate::error::ApiError;
use crate::middleware::{ApiResponse, ApiResult};
use crate::services::billing_service::WebhookOutcome;

/// Signed Stripe deliveries. The raw body is needed for signature checks,
/// so this takes bytes rather than JSON.
pub async fn stripe_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> ApiResult<WebhookOutcome> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request("Missing Stripe-Signature header"))?;

    let outcome = state.billing.handle_webhook(&body, signature).await?;
    Ok(ApiResponse::success(outcome))
}
