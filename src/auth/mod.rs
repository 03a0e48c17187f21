// auth - password hashing, JWT session tokens and credential validation

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::SecurityConfig;
use crate::database::DatabaseError;

pub mod password;
pub mod validation;

pub use password::{hash_password, verify_password};

/// Issuer stamped into every token and required on decode
pub const TOKEN_ISSUER: &str = "flowrelay-api";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("{0}")]
    InvalidToken(String),

    #[error("session revoked or expired")]
    SessionRevoked,

    #[error("refresh window expired")]
    RefreshWindowExpired,

    #[error("{field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("email already registered")]
    EmailTaken,

    #[error("user not found")]
    UserNotFound,

    #[error("JWT secret not configured")]
    MissingSecret,

    #[error("token generation failed: {0}")]
    Token(String),

    #[error("password hashing failed: {0}")]
    Hashing(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    /// User id
    pub sub: Uuid,
    pub email: String,
    /// Session id, checked against the sessions table on every request
    pub sid: Uuid,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn new(user_id: Uuid, email: impl Into<String>, session_id: Uuid, expires_at: DateTime<Utc>) -> Self {
        Self {
            sub: user_id,
            email: email.into(),
            sid: session_id,
            iss: TOKEN_ISSUER.to_string(),
            iat: Utc::now().timestamp(),
            exp: expires_at.timestamp(),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_else(Utc::now)
    }
}

/// Expiry for a token issued now
pub fn token_expiry(security: &SecurityConfig) -> DateTime<Utc> {
    Utc::now() + Duration::hours(security.jwt_expiry_hours as i64)
}

pub fn generate_jwt(claims: &Claims, security: &SecurityConfig) -> Result<String, AuthError> {
    if security.jwt_secret.is_empty() {
        return Err(AuthError::MissingSecret);
    }

    let encoding_key = EncodingKey::from_secret(security.jwt_secret.as_bytes());
    encode(&Header::new(Algorithm::HS256), claims, &encoding_key).map_err(|e| AuthError::Token(e.to_string()))
}

/// Verify signature, issuer and expiry
pub fn validate_jwt(token: &str, security: &SecurityConfig) -> Result<Claims, AuthError> {
    decode_claims(token, security, true)
}

/// Verify a token presented for refresh. The signature must be valid; an
/// expired token is accepted while it is inside the refresh window.
pub fn validate_for_refresh(token: &str, security: &SecurityConfig) -> Result<Claims, AuthError> {
    let claims = decode_claims(token, security, false)?;
    let window_end = claims.expires_at() + Duration::days(security.refresh_window_days);
    if Utc::now() > window_end {
        return Err(AuthError::RefreshWindowExpired);
    }
    Ok(claims)
}

fn decode_claims(token: &str, security: &SecurityConfig, validate_exp: bool) -> Result<Claims, AuthError> {
    if security.jwt_secret.is_empty() {
        return Err(AuthError::MissingSecret);
    }

    let decoding_key = DecodingKey::from_secret(security.jwt_secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[TOKEN_ISSUER]);
    validation.validate_exp = validate_exp;
    if !validate_exp {
        validation.required_spec_claims.remove("exp");
    }

    decode::<Claims>(token, &decoding_key, &validation)
        .map(|data| data.claims)
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn security() -> SecurityConfig {
        SecurityConfig {
            jwt_secret: "test-secret".to_string(),
            jwt_expiry_hours: 1,
            refresh_window_days: 7,
            enable_cors: true,
            cors_origins: vec![],
        }
    }

    #[test]
    fn round_trips_claims() {
        let security = security();
        let claims = Claims::new(Uuid::new_v4(), "a@example.com", Uuid::new_v4(), token_expiry(&security));
        let token = generate_jwt(&claims, &security).unwrap();
        let decoded = validate_jwt(&token, &security).unwrap();
        assert_eq!(decoded, claims);
    }

    #[test]
    fn rejects_wrong_secret() {
        let security = security();
        let claims = Claims::new(Uuid::new_v4(), "a@example.com", Uuid::new_v4(), token_expiry(&security));
        let token = generate_jwt(&claims, &security).unwrap();

        let other = SecurityConfig { jwt_secret: "other".to_string(), ..security };
        assert!(matches!(validate_jwt(&token, &other), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn expired_token_is_refreshable_inside_window() {
        let security = security();
        let expired = Utc::now() - Duration::days(1);
        let claims = Claims::new(Uuid::new_v4(), "a@example.com", Uuid::new_v4(), expired);
        let token = generate_jwt(&claims, &security).unwrap();

        assert!(validate_jwt(&token, &security).is_err());
        assert_eq!(validate_for_refresh(&token, &security).unwrap().sid, claims.sid);
    }

    #[test]
    fn refresh_window_is_enforced() {
        let security = security();
        let ancient = Utc::now() - Duration::days(30);
        let claims = Claims::new(Uuid::new_v4(), "a@example.com", Uuid::new_v4(), ancient);
        let token = generate_jwt(&claims, &security).unwrap();

        assert!(matches!(
            validate_for_refresh(&token, &security),
            Err(AuthError::RefreshWindowExpired)
        ));
    }

    #[test]
    fn empty_secret_is_refused() {
        let security = SecurityConfig { jwt_secret: String::new(), ..security() };
        let claims = Claims::new(Uuid::new_v4(), "a@example.com", Uuid::new_v4(), token_expiry(&security));
        assert!(matches!(generate_jwt(&claims, &security), Err(AuthError::MissingSecret)));
    }
}
