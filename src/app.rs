// app.rs - shared state and route table for the HTTP service

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use sqlx::PgPool;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::clients::{CompletionProvider, StripeClient};
use crate::config::{AppConfig, SecurityConfig};
use crate::database::DatabaseManager;
use crate::handlers::{protected, public};
use crate::middleware::jwt_auth_middleware;
use crate::relay::{PgRelayStore, RelayService};
use crate::services::{BillingService, UsageService, UserService, WorkflowService};

/// Everything a handler can reach. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub users: Arc<UserService>,
    pub usage: Arc<UsageService>,
    pub workflows: Arc<WorkflowService>,
    pub billing: Arc<BillingService>,
    pub relay: Arc<RelayService<PgRelayStore>>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        provider: Arc<dyn CompletionProvider>,
        stripe: Arc<StripeClient>,
    ) -> Self {
        let relay = RelayService::new(PgRelayStore::new(pool.clone()), config.sync.clone());
        Self {
            users: Arc::new(UserService::new(pool.clone(), config.security.clone())),
            usage: Arc::new(UsageService::new(pool.clone())),
            workflows: Arc::new(WorkflowService::new(pool.clone(), provider)),
            billing: Arc::new(BillingService::new(pool.clone(), stripe, config.billing.clone())),
            relay: Arc::new(relay),
            config: Arc::new(config),
            pool,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.api.max_request_size_bytes;
    let cors = cors_layer(&state.config.security);
    let request_logging = state.config.api.enable_request_logging;

    let router = Router::new()
        // Public
        .route("/", get(root))
        .route("/health", get(health))
        .merge(auth_public_routes())
        .merge(webhook_routes())
        // Protected API
        .merge(protected_routes(state.clone()))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(ServiceBuilder::new().layer(cors));

    let router = if request_logging {
        router.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
    } else {
        router
    };

    router.with_state(state)
}

fn auth_public_routes() -> Router<AppState> {
    use public::auth;

    Router::new()
        .route("/auth/register", post(auth::register_post))
        .route("/auth/login", post(auth::login_post))
        .route("/auth/refresh", post(auth::refresh_post))
}

fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhooks/stripe", post(public::webhooks::stripe_post))
}

fn protected_routes(state: AppState) -> Router<AppState> {
    use protected::{ai, auth, billing, sync, usage};

    Router::new()
        .route("/api/auth/whoami", get(auth::whoami))
        .route("/api/auth/session", delete(auth::logout))
        .route("/api/usage", get(usage::usage_get))
        .route("/api/ai/workflows", get(ai::workflows_get).post(ai::workflows_post))
        .route("/api/billing/checkout", post(billing::checkout_post))
        .route("/api/billing/portal", post(billing::portal_post))
        .route("/api/billing/subscription", get(billing::subscription_get))
        .route("/api/sync", get(sync::sync_get).post(sync::sync_post))
        .route_layer(middleware::from_fn_with_state(state, jwt_auth_middleware))
}

fn cors_layer(security: &SecurityConfig) -> CorsLayer {
    if !security.enable_cors {
        return CorsLayer::new();
    }
    if security.cors_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = security
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("stripe-signature"),
        ])
}

async fn root() -> Json<Value> {
    Json(json!({
        "success": true,
        "data": {
            "name": "FlowRelay API",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Workflow sync backend: auth, usage, AI synthesis, billing and package relay",
            "endpoints": {
                "public": ["/health", "/auth/register", "/auth/login", "/auth/refresh", "/webhooks/stripe"],
                "protected": [
                    "/api/auth/whoami",
                    "/api/auth/session",
                    "/api/usage",
                    "/api/ai/workflows",
                    "/api/billing/checkout",
                    "/api/billing/portal",
                    "/api/billing/subscription",
                    "/api/sync"
                ]
            }
        }
    }))
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let timestamp = chrono::Utc::now().to_rfc3339();
    match DatabaseManager::health_check(&state.pool).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": { "status": "ok", "timestamp": timestamp, "database": "ok" }
            })),
        ),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "success": false,
                    "error": "database unavailable",
                    "data": { "status": "degraded", "timestamp": timestamp, "database": "unavailable" }
                })),
            )
        }
    }
}
