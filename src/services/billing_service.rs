use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::usage_service::{Tier, UsageService};
use crate::clients::stripe::{self, CheckoutParams, HostedSession, SignatureError, StripeClient, StripeError};
use crate::config::BillingConfig;
use crate::database::DatabaseError;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("tier must be 'pro' or 'team', got '{0}'")]
    InvalidTier(String),

    #[error("no Stripe price configured for the {0} tier")]
    PriceNotConfigured(String),

    #[error("billing is not configured")]
    NotConfigured,

    #[error("no billing customer on record")]
    NoCustomer,

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("{0}")]
    InvalidEvent(String),

    #[error(transparent)]
    Stripe(#[from] StripeError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.into())
    }
}

/// Webhook envelope; only the fields we act on
#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: Value,
}

/// State change a webhook asks us to make
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionChange {
    CheckoutCompleted {
        user_id: Uuid,
        tier: Tier,
        customer_id: Option<String>,
        subscription_id: Option<String>,
    },
    Updated {
        subscription_id: String,
        user_id: Option<Uuid>,
        customer_id: Option<String>,
        tier: Option<Tier>,
        status: String,
        current_period_end: Option<DateTime<Utc>>,
    },
    Deleted {
        subscription_id: String,
    },
    Ignored,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookOutcome {
    pub event_id: String,
    pub event_type: String,
    pub duplicate: bool,
    pub handled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionView {
    /// Tier the caller is entitled to right now
    pub tier: Tier,
    /// Tier on the subscription record, whatever its status
    pub plan: Option<String>,
    pub status: String,
    pub current_period_end: Option<DateTime<Utc>>,
    pub effective: bool,
}

fn metadata_str<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    object["metadata"][key].as_str().filter(|s| !s.is_empty())
}

fn non_empty(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

/// Tier for a subscription object: explicit metadata first, then the price id
fn subscription_tier(object: &Value, config: &BillingConfig) -> Option<Tier> {
    if let Some(tier) = metadata_str(object, "tier").and_then(Tier::parse) {
        return Some(tier);
    }

    let price_id = object["items"]["data"][0]["price"]["id"].as_str()?;
    if config.price_pro.as_deref() == Some(price_id) {
        Some(Tier::Pro)
    } else if config.price_team.as_deref() == Some(price_id) {
        Some(Tier::Team)
    } else {
        None
    }
}

/// Translate a verified event into the change it implies
pub fn interpret_event(event: &StripeEvent, config: &BillingConfig) -> Result<SubscriptionChange, BillingError> {
    let object = &event.data.object;

    match event.event_type.as_str() {
        "checkout.session.completed" => {
            let user_id = object["client_reference_id"]
                .as_str()
                .or_else(|| metadata_str(object, "user_id"))
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| BillingError::InvalidEvent("checkout session has no user reference".to_string()))?;
            let tier = metadata_str(object, "tier")
                .and_then(Tier::parse)
                .ok_or_else(|| BillingError::InvalidEvent("checkout session has no tier".to_string()))?;

            Ok(SubscriptionChange::CheckoutCompleted {
                user_id,
                tier,
                customer_id: non_empty(&object["customer"]),
                subscription_id: non_empty(&object["subscription"]),
            })
        }
        "customer.subscription.created" | "customer.subscription.updated" => {
            let subscription_id = non_empty(&object["id"])
                .ok_or_else(|| BillingError::InvalidEvent("subscription has no id".to_string()))?;

            Ok(SubscriptionChange::Updated {
                subscription_id,
                user_id: metadata_str(object, "user_id").and_then(|s| Uuid::parse_str(s).ok()),
                customer_id: non_empty(&object["customer"]),
                tier: subscription_tier(object, config),
                status: non_empty(&object["status"]).unwrap_or_else(|| "incomplete".to_string()),
                current_period_end: object["current_period_end"]
                    .as_i64()
                    .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            })
        }
        "customer.subscription.deleted" => {
            let subscription_id = non_empty(&object["id"])
                .ok_or_else(|| BillingError::InvalidEvent("subscription has no id".to_string()))?;
            Ok(SubscriptionChange::Deleted { subscription_id })
        }
        _ => Ok(SubscriptionChange::Ignored),
    }
}

pub struct BillingService {
    pool: PgPool,
    stripe: Arc<StripeClient>,
    config: BillingConfig,
    usage: UsageService,
}

impl BillingService {
    pub fn new(pool: PgPool, stripe: Arc<StripeClient>, config: BillingConfig) -> Self {
        Self {
            usage: UsageService::new(pool.clone()),
            pool,
            stripe,
            config,
        }
    }

    pub async fn checkout(&self, user_id: Uuid, email: &str, tier: &str) -> Result<HostedSession, BillingError> {
        let price_id = match Tier::parse(tier) {
            Some(Tier::Pro) => self.config.price_pro.as_deref(),
            Some(Tier::Team) => self.config.price_team.as_deref(),
            _ => return Err(BillingError::InvalidTier(tier.to_string())),
        }
        .ok_or_else(|| BillingError::PriceNotConfigured(tier.to_string()))?;

        if !self.stripe.is_configured() {
            return Err(BillingError::NotConfigured);
        }

        let tier = tier.trim().to_ascii_lowercase();
        let session = self
            .stripe
            .create_checkout_session(&CheckoutParams {
                price_id,
                user_id,
                email,
                tier: &tier,
                success_url: &self.config.success_url,
                cancel_url: &self.config.cancel_url,
            })
            .await?;

        info!("Created checkout session {} for user {} ({})", session.id, user_id, tier);
        Ok(session)
    }

    pub async fn portal(&self, user_id: Uuid) -> Result<HostedSession, BillingError> {
        let customer_id = self
            .usage
            .subscription(user_id)
            .await?
            .and_then(|s| s.stripe_customer_id)
            .ok_or(BillingError::NoCustomer)?;

        if !self.stripe.is_configured() {
            return Err(BillingError::NotConfigured);
        }

        Ok(self
            .stripe
            .create_portal_session(&customer_id, &self.config.portal_return_url)
            .await?)
    }

    pub async fn subscription(&self, user_id: Uuid) -> Result<SubscriptionView, BillingError> {
        let view = match self.usage.subscription(user_id).await? {
            Some(s) => SubscriptionView {
                tier: s.effective_tier(),
                effective: s.is_effective(),
                plan: Some(s.tier),
                status: s.status,
                current_period_end: s.current_period_end,
            },
            None => SubscriptionView {
                tier: Tier::Free,
                plan: None,
                status: "none".to_string(),
                current_period_end: None,
                effective: false,
            },
        };
        Ok(view)
    }

    /// Verify, deduplicate and apply one webhook delivery
    pub async fn handle_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookOutcome, BillingError> {
        let secret = self.config.webhook_secret.as_deref().unwrap_or("");
        stripe::verify_signature(
            payload,
            signature,
            secret,
            self.config.webhook_tolerance_secs,
            Utc::now().timestamp(),
        )?;

        let event: StripeEvent = serde_json::from_slice(payload)
            .map_err(|e| BillingError::InvalidEvent(format!("unreadable event: {}", e)))?;
        let change = interpret_event(&event, &self.config)?;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query("INSERT INTO billing_events (id, event_type) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING")
            .bind(&event.id)
            .bind(&event.event_type)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            info!("Ignoring duplicate webhook {}", event.id);
            return Ok(WebhookOutcome {
                event_id: event.id,
                event_type: event.event_type,
                duplicate: true,
                handled: false,
            });
        }

        let handled = change != SubscriptionChange::Ignored;
        Self::apply(&mut tx, change).await?;
        tx.commit().await?;

        info!("Processed webhook {} ({})", event.id, event.event_type);
        Ok(WebhookOutcome {
            event_id: event.id,
            event_type: event.event_type,
            duplicate: false,
            handled,
        })
    }

    async fn apply(tx: &mut Transaction<'_, Postgres>, change: SubscriptionChange) -> Result<(), BillingError> {
        match change {
            SubscriptionChange::CheckoutCompleted {
                user_id,
                tier,
                customer_id,
                subscription_id,
            } => {
                sqlx::query(
                    "INSERT INTO subscriptions (user_id, tier, status, stripe_customer_id, stripe_subscription_id, updated_at)
                     VALUES ($1, $2, 'active', $3, $4, now())
                     ON CONFLICT (user_id) DO UPDATE SET
                         tier = EXCLUDED.tier,
                         status = 'active',
                         stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, subscriptions.stripe_customer_id),
                         stripe_subscription_id = COALESCE(EXCLUDED.stripe_subscription_id, subscriptions.stripe_subscription_id),
                         updated_at = now()",
                )
                .bind(user_id)
                .bind(tier.as_str())
                .bind(customer_id)
                .bind(subscription_id)
                .execute(&mut **tx)
                .await?;
                info!("User {} subscribed to {}", user_id, tier.as_str());
            }
            SubscriptionChange::Updated {
                subscription_id,
                user_id,
                customer_id,
                tier,
                status,
                current_period_end,
            } => {
                let updated = sqlx::query(
                    "UPDATE subscriptions SET
                         tier = COALESCE($2, tier),
                         status = $3,
                         current_period_end = $4,
                         stripe_customer_id = COALESCE($5, stripe_customer_id),
                         updated_at = now()
                     WHERE stripe_subscription_id = $1",
                )
                .bind(&subscription_id)
                .bind(tier.map(|t| t.as_str()))
                .bind(&status)
                .bind(current_period_end)
                .bind(&customer_id)
                .execute(&mut **tx)
                .await?
                .rows_affected();

                // Subscription events can beat checkout.session.completed
                if updated == 0 {
                    match user_id {
                        Some(user_id) => {
                            sqlx::query(
                                "INSERT INTO subscriptions (user_id, tier, status, stripe_customer_id, stripe_subscription_id,
                                                            current_period_end, updated_at)
                                 VALUES ($1, $2, $3, $4, $5, $6, now())
                                 ON CONFLICT (user_id) DO UPDATE SET
                                     tier = EXCLUDED.tier,
                                     status = EXCLUDED.status,
                                     stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, subscriptions.stripe_customer_id),
                                     stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                                     current_period_end = EXCLUDED.current_period_end,
                                     updated_at = now()",
                            )
                            .bind(user_id)
                            .bind(tier.unwrap_or_default().as_str())
                            .bind(&status)
                            .bind(&customer_id)
                            .bind(&subscription_id)
                            .bind(current_period_end)
                            .execute(&mut **tx)
                            .await?;
                        }
                        None => warn!("Subscription {} is not linked to any user", subscription_id),
                    }
                }
            }
            SubscriptionChange::Deleted { subscription_id } => {
                sqlx::query(
                    "UPDATE subscriptions SET status = 'canceled', tier = 'free', updated_at = now()
                     WHERE stripe_subscription_id = $1",
                )
                .bind(&subscription_id)
                .execute(&mut **tx)
                .await?;
                info!("Subscription {} canceled", subscription_id);
            }
            SubscriptionChange::Ignored => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> BillingConfig {
        BillingConfig {
            stripe_secret_key: None,
            webhook_secret: Some("whsec_test".to_string()),
            api_base: "https://api.stripe.com".to_string(),
            price_pro: Some("price_pro".to_string()),
            price_team: Some("price_team".to_string()),
            success_url: "https://app/success".to_string(),
            cancel_url: "https://app/cancel".to_string(),
            portal_return_url: "https://app/account".to_string(),
            webhook_tolerance_secs: 300,
        }
    }

    fn event(event_type: &str, object: Value) -> StripeEvent {
        serde_json::from_value(json!({
            "id": "evt_1",
            "type": event_type,
            "data": { "object": object }
        }))
        .unwrap()
    }

    #[test]
    fn checkout_completion_links_user_and_tier() {
        let user_id = Uuid::new_v4();
        let change = interpret_event(
            &event(
                "checkout.session.completed",
                json!({
                    "client_reference_id": user_id.to_string(),
                    "customer": "cus_1",
                    "subscription": "sub_1",
                    "metadata": { "tier": "team" }
                }),
            ),
            &config(),
        )
        .unwrap();

        assert_eq!(
            change,
            SubscriptionChange::CheckoutCompleted {
                user_id,
                tier: Tier::Team,
                customer_id: Some("cus_1".to_string()),
                subscription_id: Some("sub_1".to_string()),
            }
        );
    }

    #[test]
    fn checkout_falls_back_to_metadata_user() {
        let user_id = Uuid::new_v4();
        let change = interpret_event(
            &event(
                "checkout.session.completed",
                json!({ "metadata": { "user_id": user_id.to_string(), "tier": "pro" } }),
            ),
            &config(),
        )
        .unwrap();
        assert!(matches!(change, SubscriptionChange::CheckoutCompleted { user_id: u, .. } if u == user_id));
    }

    #[test]
    fn checkout_without_user_is_invalid() {
        let result = interpret_event(
            &event("checkout.session.completed", json!({ "metadata": { "tier": "pro" } })),
            &config(),
        );
        assert!(matches!(result, Err(BillingError::InvalidEvent(_))));
    }

    #[test]
    fn subscription_update_maps_price_to_tier() {
        let change = interpret_event(
            &event(
                "customer.subscription.updated",
                json!({
                    "id": "sub_1",
                    "status": "past_due",
                    "current_period_end": 1_767_225_600,
                    "items": { "data": [ { "price": { "id": "price_team" } } ] }
                }),
            ),
            &config(),
        )
        .unwrap();

        match change {
            SubscriptionChange::Updated { tier, status, current_period_end, .. } => {
                assert_eq!(tier, Some(Tier::Team));
                assert_eq!(status, "past_due");
                assert_eq!(current_period_end, Utc.timestamp_opt(1_767_225_600, 0).single());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn metadata_tier_beats_price() {
        let object = json!({
            "metadata": { "tier": "pro" },
            "items": { "data": [ { "price": { "id": "price_team" } } ] }
        });
        assert_eq!(subscription_tier(&object, &config()), Some(Tier::Pro));
        assert_eq!(subscription_tier(&json!({}), &config()), None);
    }

    #[test]
    fn deletion_and_unknown_events() {
        assert_eq!(
            interpret_event(&event("customer.subscription.deleted", json!({ "id": "sub_9" })), &config()).unwrap(),
            SubscriptionChange::Deleted {
                subscription_id: "sub_9".to_string()
            }
        );
        assert_eq!(
            interpret_event(&event("invoice.paid", json!({})), &config()).unwrap(),
            SubscriptionChange::Ignored
        );
    }
}
