// handlers/public/auth/mod.rs - token acquisition

use axum::http::HeaderMap;

pub mod login;    // POST /auth/login
pub mod refresh;  // POST /auth/refresh
pub mod register; // POST /auth/register

pub use login::login_post;
pub use refresh::refresh_post;
pub use register::register_post;

/// Client identification stored on the session
pub(crate) fn user_agent(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
}
