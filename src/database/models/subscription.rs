use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::services::usage_service::Tier;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub user_id: Uuid,
    pub tier: String,
    pub status: String,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Stripe statuses that grant the paid tier
    pub fn is_effective(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }

    /// Tier the user is entitled to right now
    pub fn effective_tier(&self) -> Tier {
        if self.is_effective() {
            Tier::parse(&self.tier).unwrap_or(Tier::Free)
        } else {
            Tier::Free
        }
    }
}
