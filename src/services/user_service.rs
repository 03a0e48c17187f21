use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::validation::{normalize_email, validate_password};
use crate::auth::{self, AuthError, Claims};
use crate::config::SecurityConfig;
use crate::database::models::{Session, User};
use crate::database::DatabaseError;

const MAX_DISPLAY_NAME_LENGTH: usize = 100;
const MAX_USER_AGENT_LENGTH: usize = 255;

/// Verified against on the unknown-account path so both login failures cost one argon2 run
static DUMMY_HASH: Lazy<String> = Lazy::new(|| auth::hash_password("flowrelay-unknown-account").unwrap_or_default());

/// Token handed back by register, login and refresh
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

/// Accounts and the sessions that back their tokens
pub struct UserService {
    pool: PgPool,
    security: SecurityConfig,
}

impl UserService {
    pub fn new(pool: PgPool, security: SecurityConfig) -> Self {
        Self { pool, security }
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<IssuedToken, AuthError> {
        let email = normalize_email(email)?;
        validate_password(password)?;
        let display_name = clean_display_name(display_name)?;

        let password_hash = auth::hash_password(password)?;
        let result = sqlx::query_as::<_, User>(
            "INSERT INTO users (email, display_name, password_hash)
             VALUES ($1, $2, $3)
             RETURNING id, email, display_name, password_hash, created_at, updated_at",
        )
        .bind(&email)
        .bind(&display_name)
        .bind(&password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from);

        let user = match result {
            Ok(user) => user,
            Err(e) if e.is_unique_violation() => return Err(AuthError::EmailTaken),
            Err(e) => return Err(e.into()),
        };

        info!("Registered user {} ({})", user.id, user.email);
        self.issue(user, user_agent).await
    }

    pub async fn login(&self, email: &str, password: &str, user_agent: Option<&str>) -> Result<IssuedToken, AuthError> {
        // Unknown accounts and bad passwords are indistinguishable to the caller
        let email = normalize_email(email).map_err(|_| AuthError::InvalidCredentials)?;

        let Some(user) = self.find_by_email(&email).await? else {
            let _ = auth::verify_password(password, &DUMMY_HASH);
            warn!("Failed login for unknown account {}", email);
            return Err(AuthError::InvalidCredentials);
        };

        if !auth::verify_password(password, &user.password_hash)? {
            warn!("Failed login for user {}", user.id);
            return Err(AuthError::InvalidCredentials);
        }

        info!("User {} logged in", user.id);
        self.issue(user, user_agent).await
    }

    /// Rotate: the presented session is revoked and a new one is issued
    pub async fn refresh(&self, token: &str, user_agent: Option<&str>) -> Result<IssuedToken, AuthError> {
        let claims = auth::validate_for_refresh(token, &self.security)?;

        let session = self.find_session(claims.sid).await?.ok_or(AuthError::SessionRevoked)?;
        if session.user_id != claims.sub || session.revoked_at.is_some() {
            return Err(AuthError::SessionRevoked);
        }

        let user = self.find_user(claims.sub).await?.ok_or(AuthError::UserNotFound)?;
        // Only the caller that actually revokes the session gets a new one
        rotation_claimed(self.revoke_session(session.id).await?)?;

        info!("Rotated session {} for user {}", session.id, user.id);
        self.issue(user, user_agent).await
    }

    pub async fn logout(&self, session_id: Uuid) -> Result<(), AuthError> {
        self.revoke_session(session_id).await?;
        info!("Session {} logged out", session_id);
        Ok(())
    }

    pub async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, DatabaseError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, display_name, password_hash, created_at, updated_at FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, display_name, password_hash, created_at, updated_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, DatabaseError> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT id, user_id, user_agent, created_at, expires_at, revoked_at FROM sessions WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    /// Check that a verified token still maps to a live session
    pub async fn require_active_session(&self, claims: &Claims) -> Result<Session, AuthError> {
        let session = self.find_session(claims.sid).await?.ok_or(AuthError::SessionRevoked)?;
        if session.user_id != claims.sub || !session.is_active(Utc::now()) {
            return Err(AuthError::SessionRevoked);
        }
        Ok(session)
    }

    /// Returns the number of sessions this call revoked (0 or 1)
    async fn revoke_session(&self, session_id: Uuid) -> Result<u64, DatabaseError> {
        let result = sqlx::query("UPDATE sessions SET revoked_at = now() WHERE id = $1 AND revoked_at IS NULL")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Create a session and sign a token for it. The session outlives the
    /// token by the refresh window so an expired token can still be rotated.
    async fn issue(&self, user: User, user_agent: Option<&str>) -> Result<IssuedToken, AuthError> {
        let session_id = Uuid::new_v4();
        let expires_at = auth::token_expiry(&self.security);
        let session_expires_at = expires_at + Duration::days(self.security.refresh_window_days);
        let user_agent = user_agent.map(|ua| ua.chars().take(MAX_USER_AGENT_LENGTH).collect::<String>());

        let claims = Claims::new(user.id, user.email.clone(), session_id, expires_at);
        let token = auth::generate_jwt(&claims, &self.security)?;

        sqlx::query("INSERT INTO sessions (id, user_id, user_agent, expires_at) VALUES ($1, $2, $3, $4)")
            .bind(session_id)
            .bind(user.id)
            .bind(user_agent)
            .bind(session_expires_at)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from)?;

        Ok(IssuedToken { token, expires_at, user })
    }
}

fn rotation_claimed(revoked: u64) -> Result<(), AuthError> {
    if revoked == 1 {
        Ok(())
    } else {
        Err(AuthError::SessionRevoked)
    }
}

fn clean_display_name(display_name: Option<&str>) -> Result<Option<String>, AuthError> {
    let Some(name) = display_name.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(None);
    };
    if name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
        return Err(AuthError::Validation {
            field: "display_name",
            message: format!("Display name must be at most {} characters", MAX_DISPLAY_NAME_LENGTH),
        });
    }
    Ok(Some(name.to_string()))
}
