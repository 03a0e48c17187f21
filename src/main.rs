use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flowrelay_api::app::{build_router, AppState};
use flowrelay_api::clients::{AnthropicClient, CompletionProvider, StripeClient};
use flowrelay_api::database::DatabaseManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present so cargo run picks up DATABASE_URL, JWT_SECRET, etc.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=info")))
        .init();

    let config = flowrelay_api::config::config();
    info!("Starting FlowRelay API in {:?} mode", config.environment);
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    if config.security.jwt_secret.is_empty() {
        if flowrelay_api::is_production!() {
            anyhow::bail!("JWT_SECRET must be set in production");
        }
        warn!("JWT_SECRET is empty; tokens cannot be issued or verified");
    }

    let pool = DatabaseManager::connect(&config.database).context("database pool")?;
    if config.database.auto_migrate {
        if let Err(e) = DatabaseManager::migrate(&pool).await {
            error!("Schema migration failed: {}", e);
        }
    }

    let provider: Arc<dyn CompletionProvider> = Arc::new(AnthropicClient::new(config.ai.clone())?);
    let stripe = Arc::new(StripeClient::new(&config.billing)?);
    if config.ai.api_key.is_none() {
        warn!("ANTHROPIC_API_KEY is not set; workflow generation is disabled");
    }
    if !stripe.is_configured() {
        warn!("STRIPE_SECRET_KEY is not set; checkout and portal are disabled");
    }

    let state = AppState::new(pool.clone(), config.clone(), provider, stripe);
    let app = build_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.api.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    info!("FlowRelay API listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server")?;

    DatabaseManager::close(&pool).await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
