use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::BillingConfig;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum StripeError {
    #[error("Stripe secret key is not configured")]
    NotConfigured,

    #[error("request to Stripe failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Stripe returned {status}: {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum SignatureError {
    #[error("webhook secret is not configured")]
    NoSecret,

    #[error("malformed Stripe-Signature header")]
    Malformed,

    #[error("no v1 signature in header")]
    NoSignature,

    #[error("timestamp outside tolerance")]
    Stale,

    #[error("signature mismatch")]
    Mismatch,
}

/// Hex HMAC-SHA256 over `"{timestamp}.{payload}"`
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, SignatureError> {
    Ok(hex::encode(signed_mac(secret, timestamp, payload)?.finalize().into_bytes()))
}

fn signed_mac(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::NoSecret)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Check a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=<hex>...]`)
/// against the raw request body.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::NoSecret);
    }

    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let (key, value) = part.trim().split_once('=').ok_or(SignatureError::Malformed)?;
        match key {
            "t" => timestamp = Some(value.parse::<i64>().map_err(|_| SignatureError::Malformed)?),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::NoSignature);
    }
    if (now - timestamp).abs() > tolerance_secs {
        return Err(SignatureError::Stale);
    }

    let mut matched = false;
    for candidate in signatures {
        if let Ok(bytes) = hex::decode(candidate) {
            if signed_mac(secret, timestamp, payload)?.verify_slice(&bytes).is_ok() {
                matched = true;
                break;
            }
        }
    }

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Inputs for a subscription checkout session
#[derive(Debug, Clone)]
pub struct CheckoutParams<'a> {
    pub price_id: &'a str,
    pub user_id: Uuid,
    pub email: &'a str,
    pub tier: &'a str,
    pub success_url: &'a str,
    pub cancel_url: &'a str,
}

/// Form fields for `POST /v1/checkout/sessions`
pub fn checkout_form(params: &CheckoutParams<'_>) -> Vec<(String, String)> {
    let user_id = params.user_id.to_string();
    vec![
        ("mode".into(), "subscription".into()),
        ("line_items[0][price]".into(), params.price_id.into()),
        ("line_items[0][quantity]".into(), "1".into()),
        ("client_reference_id".into(), user_id.clone()),
        ("customer_email".into(), params.email.into()),
        ("metadata[user_id]".into(), user_id.clone()),
        ("metadata[tier]".into(), params.tier.into()),
        ("subscription_data[metadata][user_id]".into(), user_id),
        ("subscription_data[metadata][tier]".into(), params.tier.into()),
        ("success_url".into(), params.success_url.into()),
        ("cancel_url".into(), params.cancel_url.into()),
    ]
}

/// Hosted page Stripe redirects the customer to
#[derive(Debug, Clone, Deserialize)]
pub struct HostedSession {
    pub id: String,
    pub url: Option<String>,
}

/// Minimal Stripe REST client (form-encoded requests, JSON replies)
pub struct StripeClient {
    http: Client,
    secret_key: Option<String>,
    api_base: String,
}

impl StripeClient {
    pub fn new(config: &BillingConfig) -> Result<Self, StripeError> {
        let http = Client::builder().timeout(Duration::from_secs(20)).build()?;
        Ok(Self {
            http,
            secret_key: config.stripe_secret_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.secret_key.is_some()
    }

    pub async fn create_checkout_session(&self, params: &CheckoutParams<'_>) -> Result<HostedSession, StripeError> {
        let reply = self.post_form("/v1/checkout/sessions", &checkout_form(params)).await?;
        serde_json::from_value(reply).map_err(|e| StripeError::Api {
            status: 200,
            message: format!("unexpected checkout session shape: {}", e),
        })
    }

    pub async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> Result<HostedSession, StripeError> {
        let form = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("return_url".to_string(), return_url.to_string()),
        ];
        let reply = self.post_form("/v1/billing_portal/sessions", &form).await?;
        serde_json::from_value(reply).map_err(|e| StripeError::Api {
            status: 200,
            message: format!("unexpected portal session shape: {}", e),
        })
    }

    async fn post_form(&self, path: &str, form: &[(String, String)]) -> Result<Value, StripeError> {
        let secret_key = self.secret_key.as_deref().ok_or(StripeError::NotConfigured)?;

        let response = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(secret_key)
            .form(form)
            .send()
            .await?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error").to_string();
            return Err(StripeError::Api {
                status: status.as_u16(),
                message,
            });
        }

        debug!("Stripe {} -> {}", path, status);
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const BODY: &[u8] = br#"{"id":"evt_1","type":"ping"}"#;

    fn header(timestamp: i64, signature: &str) -> String {
        format!("t={},v1={}", timestamp, signature)
    }

    #[test]
    fn accepts_valid_signature() {
        let sig = sign_payload(SECRET, 1_700_000_000, BODY).unwrap();
        assert_eq!(
            verify_signature(BODY, &header(1_700_000_000, &sig), SECRET, 300, 1_700_000_100),
            Ok(())
        );
    }

    #[test]
    fn accepts_any_matching_v1_entry() {
        let sig = sign_payload(SECRET, 1_700_000_000, BODY).unwrap();
        let header = format!("t=1700000000,v1={},v1={},v0=ignored", "00".repeat(32), sig);
        assert!(verify_signature(BODY, &header, SECRET, 300, 1_700_000_000).is_ok());
    }

    #[test]
    fn rejects_tampered_body() {
        let sig = sign_payload(SECRET, 1_700_000_000, BODY).unwrap();
        assert_eq!(
            verify_signature(b"{}", &header(1_700_000_000, &sig), SECRET, 300, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_stale_timestamp() {
        let sig = sign_payload(SECRET, 1_700_000_000, BODY).unwrap();
        assert_eq!(
            verify_signature(BODY, &header(1_700_000_000, &sig), SECRET, 300, 1_700_000_301),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn rejects_malformed_headers() {
        assert_eq!(verify_signature(BODY, "garbage", SECRET, 300, 0), Err(SignatureError::Malformed));
        assert_eq!(verify_signature(BODY, "v1=abcd", SECRET, 300, 0), Err(SignatureError::Malformed));
        assert_eq!(verify_signature(BODY, "t=0", SECRET, 300, 0), Err(SignatureError::NoSignature));
        assert_eq!(verify_signature(BODY, "t=0,v1=zz", SECRET, 300, 0), Err(SignatureError::Mismatch));
        assert_eq!(verify_signature(BODY, "t=0,v1=00", "", 300, 0), Err(SignatureError::NoSecret));
    }

    #[test]
    fn checkout_form_carries_metadata() {
        let user_id = Uuid::new_v4();
        let form = checkout_form(&CheckoutParams {
            price_id: "price_pro",
            user_id,
            email: "a@example.com",
            tier: "pro",
            success_url: "https://app/success",
            cancel_url: "https://app/cancel",
        });

        let get = |key: &str| form.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
        assert_eq!(get("mode"), Some("subscription"));
        assert_eq!(get("line_items[0][price]"), Some("price_pro"));
        assert_eq!(get("client_reference_id"), Some(user_id.to_string().as_str()));
        assert_eq!(get("metadata[tier]"), Some("pro"));
        assert_eq!(get("subscription_data[metadata][user_id]"), Some(user_id.to_string().as_str()));
        assert_eq!(get("cancel_url"), Some("https://app/cancel"));
    }
}
