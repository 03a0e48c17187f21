use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub security: SecurityConfig,
    pub ai: AiConfig,
    pub billing: BillingConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(skip_serializing)]
    pub url: String,
    pub max_connections: u32,
    pub connection_timeout: u64,
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub port: u16,
    pub enable_request_logging: bool,
    pub max_request_size_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(skip_serializing)]
    pub jwt_secret: String,
    pub jwt_expiry_hours: u64,
    pub refresh_window_days: i64,
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub api_version: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    #[serde(skip_serializing)]
    pub stripe_secret_key: Option<String>,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub api_base: String,
    pub price_pro: Option<String>,
    pub price_team: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
    pub portal_return_url: String,
    pub webhook_tolerance_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Largest decoded payload accepted by a single inline upload
    pub inline_threshold_bytes: usize,
    /// Largest decoded payload accepted for one chunk
    pub chunk_size_limit_bytes: usize,
    pub max_chunks: u32,
    pub default_list_limit: i64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let environment = match env::var("APP_ENV").as_deref() {
            Ok("production") | Ok("prod") => Environment::Production,
            Ok("staging") | Ok("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        // Set defaults based on environment, then override with specific env vars
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
            Environment::Development => Self::development(),
        }
        .with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        // Database overrides
        if let Ok(v) = env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = env::var("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = v.parse().unwrap_or(self.database.max_connections);
        }
        if let Ok(v) = env::var("DATABASE_CONNECTION_TIMEOUT") {
            self.database.connection_timeout = v.parse().unwrap_or(self.database.connection_timeout);
        }
        if let Ok(v) = env::var("DATABASE_AUTO_MIGRATE") {
            self.database.auto_migrate = v.parse().unwrap_or(self.database.auto_migrate);
        }

        // API overrides
        if let Some(port) = env::var("FLOWRELAY_PORT")
            .ok()
            .or_else(|| env::var("PORT").ok())
            .and_then(|s| s.parse::<u16>().ok())
        {
            self.api.port = port;
        }
        if let Ok(v) = env::var("API_ENABLE_REQUEST_LOGGING") {
            self.api.enable_request_logging = v.parse().unwrap_or(self.api.enable_request_logging);
        }
        if let Ok(v) = env::var("API_MAX_REQUEST_SIZE_BYTES") {
            self.api.max_request_size_bytes = v.parse().unwrap_or(self.api.max_request_size_bytes);
        }

        // Security overrides
        if let Ok(v) = env::var("JWT_SECRET") {
            self.security.jwt_secret = v;
        }
        if let Ok(v) = env::var("SECURITY_JWT_EXPIRY_HOURS") {
            self.security.jwt_expiry_hours = v.parse().unwrap_or(self.security.jwt_expiry_hours);
        }
        if let Ok(v) = env::var("SECURITY_REFRESH_WINDOW_DAYS") {
            self.security.refresh_window_days = v.parse().unwrap_or(self.security.refresh_window_days);
        }
        if let Ok(v) = env::var("SECURITY_ENABLE_CORS") {
            self.security.enable_cors = v.parse().unwrap_or(self.security.enable_cors);
        }
        if let Ok(v) = env::var("SECURITY_CORS_ORIGINS") {
            self.security.cors_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // AI provider overrides
        if let Ok(v) = env::var("ANTHROPIC_API_KEY") {
            self.ai.api_key = Some(v).filter(|k| !k.is_empty());
        }
        if let Ok(v) = env::var("AI_BASE_URL") {
            self.ai.base_url = v;
        }
        if let Ok(v) = env::var("AI_MODEL") {
            self.ai.model = v;
        }
        if let Ok(v) = env::var("AI_MAX_TOKENS") {
            self.ai.max_tokens = v.parse().unwrap_or(self.ai.max_tokens);
        }
        if let Ok(v) = env::var("AI_TIMEOUT_SECS") {
            self.ai.timeout_secs = v.parse().unwrap_or(self.ai.timeout_secs);
        }

        // Billing overrides
        if let Ok(v) = env::var("STRIPE_SECRET_KEY") {
            self.billing.stripe_secret_key = Some(v).filter(|k| !k.is_empty());
        }
        if let Ok(v) = env::var("STRIPE_WEBHOOK_SECRET") {
            self.billing.webhook_secret = Some(v).filter(|k| !k.is_empty());
        }
        if let Ok(v) = env::var("STRIPE_API_BASE") {
            self.billing.api_base = v;
        }
        if let Ok(v) = env::var("STRIPE_PRICE_PRO") {
            self.billing.price_pro = Some(v).filter(|k| !k.is_empty());
        }
        if let Ok(v) = env::var("STRIPE_PRICE_TEAM") {
            self.billing.price_team = Some(v).filter(|k| !k.is_empty());
        }
        if let Ok(v) = env::var("BILLING_SUCCESS_URL") {
            self.billing.success_url = v;
        }
        if let Ok(v) = env::var("BILLING_CANCEL_URL") {
            self.billing.cancel_url = v;
        }
        if let Ok(v) = env::var("BILLING_PORTAL_RETURN_URL") {
            self.billing.portal_return_url = v;
        }
        if let Ok(v) = env::var("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            self.billing.webhook_tolerance_secs = v.parse().unwrap_or(self.billing.webhook_tolerance_secs);
        }

        // Sync relay overrides
        if let Ok(v) = env::var("SYNC_INLINE_THRESHOLD_BYTES") {
            self.sync.inline_threshold_bytes = v.parse().unwrap_or(self.sync.inline_threshold_bytes);
        }
        if let Ok(v) = env::var("SYNC_CHUNK_SIZE_LIMIT_BYTES") {
            self.sync.chunk_size_limit_bytes = v.parse().unwrap_or(self.sync.chunk_size_limit_bytes);
        }
        if let Ok(v) = env::var("SYNC_MAX_CHUNKS") {
            self.sync.max_chunks = v.parse().unwrap_or(self.sync.max_chunks);
        }
        self.sync = self.sync.clamped();

        self
    }

    /// Settings that load fine but cannot work together; logged at startup
    pub fn warnings(&self) -> Vec<String> {
        let body_limit = self.api.max_request_size_bytes;
        let mut warnings = Vec::new();
        for (name, decoded) in [
            ("SYNC_CHUNK_SIZE_LIMIT_BYTES", self.sync.chunk_size_limit_bytes),
            ("SYNC_INLINE_THRESHOLD_BYTES", self.sync.inline_threshold_bytes),
        ] {
            let encoded = base64_len(decoded) + REQUEST_ENVELOPE_BYTES;
            if encoded > body_limit {
                warnings.push(format!(
                    "{} ({} bytes) needs a {} byte request but API_MAX_REQUEST_SIZE_BYTES is {}; payloads near the limit will be rejected",
                    name, decoded, encoded, body_limit
                ));
            }
        }
        warnings
    }

    fn development() -> Self {
        Self {
            environment: Environment::Development,
            database: DatabaseConfig {
                url: "postgres://postgres@localhost:5432/flowrelay".to_string(),
                max_connections: 10,
                connection_timeout: 30,
                auto_migrate: true,
            },
            api: ApiConfig {
                port: 3000,
                enable_request_logging: true,
                max_request_size_bytes: 10 * 1024 * 1024, // 10MB
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 24 * 7, // 1 week
                refresh_window_days: 7,
                enable_cors: true,
                cors_origins: vec!["*".to_string()],
            },
            ai: AiConfig::defaults(),
            billing: BillingConfig::defaults("http://localhost:5173"),
            sync: SyncConfig::defaults(),
        }
    }

    fn staging() -> Self {
        Self {
            environment: Environment::Staging,
            database: DatabaseConfig {
                url: String::new(),
                max_connections: 20,
                connection_timeout: 10,
                auto_migrate: true,
            },
            api: ApiConfig {
                port: 3000,
                enable_request_logging: true,
                max_request_size_bytes: 5 * 1024 * 1024, // 5MB
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 24,
                refresh_window_days: 7,
                enable_cors: true,
                cors_origins: vec!["https://staging.example.com".to_string()],
            },
            ai: AiConfig::defaults(),
            billing: BillingConfig::defaults("https://staging.example.com"),
            sync: SyncConfig::defaults(),
        }
    }

    fn production() -> Self {
        Self {
            environment: Environment::Production,
            database: DatabaseConfig {
                url: String::new(),
                max_connections: 50,
                connection_timeout: 5,
                auto_migrate: false,
            },
            api: ApiConfig {
                port: 3000,
                enable_request_logging: false,
                max_request_size_bytes: 2 * 1024 * 1024, // 2MB
            },
            security: SecurityConfig {
                jwt_secret: String::new(),
                jwt_expiry_hours: 4,
                refresh_window_days: 3,
                enable_cors: true,
                cors_origins: vec!["https://app.example.com".to_string()],
            },
            ai: AiConfig::defaults(),
            billing: BillingConfig::defaults("https://app.example.com"),
            sync: SyncConfig::defaults(),
        }
    }
}

impl AiConfig {
    fn defaults() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.anthropic.com".to_string(),
            api_version: "2023-06-01".to_string(),
            model: "claude-3-5-sonnet-latest".to_string(),
            max_tokens: 4096,
            timeout_secs: 60,
        }
    }
}

impl BillingConfig {
    fn defaults(app_url: &str) -> Self {
        Self {
            stripe_secret_key: None,
            webhook_secret: None,
            api_base: "https://api.stripe.com".to_string(),
            price_pro: None,
            price_team: None,
            success_url: format!("{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}", app_url),
            cancel_url: format!("{}/billing/cancel", app_url),
            portal_return_url: format!("{}/settings/billing", app_url),
            webhook_tolerance_secs: 300,
        }
    }
}

/// Room for the JSON keys and ids around a base64 payload
const REQUEST_ENVELOPE_BYTES: usize = 1024;

/// chunk_count is stored as a 32-bit integer
const MAX_CHUNKS_CEILING: u32 = i32::MAX as u32;

fn base64_len(decoded: usize) -> usize {
    decoded.div_ceil(3) * 4
}

impl SyncConfig {
    /// Pull limits back into the range the relay can store
    pub fn clamped(mut self) -> Self {
        self.max_chunks = self.max_chunks.clamp(1, MAX_CHUNKS_CEILING);
        self.chunk_size_limit_bytes = self.chunk_size_limit_bytes.max(1);
        self
    }

    fn defaults() -> Self {
        Self {
            inline_threshold_bytes: 512 * 1024,
            chunk_size_limit_bytes: 1024 * 1024,
            max_chunks: 1024,
            default_list_limit: 50,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

// Global singleton config - initialized once at startup
pub static CONFIG: Lazy<AppConfig> = Lazy::new(AppConfig::from_env);

// Convenience function for accessing config
pub fn config() -> &'static AppConfig {
    &CONFIG
}

#[macro_export]
macro_rules! is_production {
    () => {
        matches!($crate::config::CONFIG.environment, $crate::config::Environment::Production)
    };
}
