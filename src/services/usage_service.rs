use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::database::models::Subscription;
use crate::database::DatabaseError;

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("{metric} quota exceeded on the {tier} tier ({used}/{limit})")]
    QuotaExceeded {
        metric: String,
        tier: String,
        used: i64,
        limit: i64,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Subscription tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Team,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Team => "team",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Tier::Free),
            "pro" => Some(Tier::Pro),
            "team" => Some(Tier::Team),
            _ => None,
        }
    }

    /// Monthly allowance for a metric. `None` is unlimited.
    pub fn limit(&self, metric: Metric) -> Option<i64> {
        match (self, metric) {
            (Tier::Free, Metric::AiGeneration) => Some(5),
            (Tier::Free, Metric::SyncUpload) => Some(50),
            (Tier::Pro, Metric::AiGeneration) => Some(200),
            (Tier::Pro, Metric::SyncUpload) => Some(2000),
            (Tier::Team, Metric::AiGeneration) => Some(1000),
            (Tier::Team, Metric::SyncUpload) => None,
        }
    }
}

/// Metered actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    AiGeneration,
    SyncUpload,
}

impl Metric {
    pub const ALL: [Metric; 2] = [Metric::AiGeneration, Metric::SyncUpload];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::AiGeneration => "ai_generation",
            Metric::SyncUpload => "sync_upload",
        }
    }
}

/// Calendar month (UTC) containing `now`, as `[start, end)`
pub fn billing_period(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let (next_year, next_month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    (month_start(now.year(), now.month(), now), month_start(next_year, next_month, now))
}

fn month_start(year: i32, month: u32, fallback: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single().unwrap_or(fallback)
}

/// Reject when one more unit would exceed the tier's allowance
pub fn evaluate_quota(tier: Tier, metric: Metric, used: i64) -> Result<(), UsageError> {
    match tier.limit(metric) {
        Some(limit) if used + 1 > limit => Err(UsageError::QuotaExceeded {
            metric: metric.as_str().to_string(),
            tier: tier.as_str().to_string(),
            used,
            limit,
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricUsage {
    pub used: i64,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
}

impl MetricUsage {
    pub fn new(used: i64, limit: Option<i64>) -> Self {
        Self {
            used,
            limit,
            remaining: limit.map(|l| (l - used).max(0)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub tier: Tier,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub metrics: BTreeMap<&'static str, MetricUsage>,
}

pub struct UsageService {
    pool: PgPool,
}

impl UsageService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn subscription(&self, user_id: Uuid) -> Result<Option<Subscription>, DatabaseError> {
        let subscription = sqlx::query_as::<_, Subscription>(
            "SELECT user_id, tier, status, stripe_customer_id, stripe_subscription_id, current_period_end, updated_at
             FROM subscriptions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscription)
    }

    pub async fn effective_tier(&self, user_id: Uuid) -> Result<Tier, DatabaseError> {
        Ok(self
            .subscription(user_id)
            .await?
            .map(|s| s.effective_tier())
            .unwrap_or_default())
    }

    async fn used_since(&self, user_id: Uuid, metric: Metric, since: DateTime<Utc>) -> Result<i64, DatabaseError> {
        let (used,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM usage_events
             WHERE user_id = $1 AND metric = $2 AND created_at >= $3",
        )
        .bind(user_id)
        .bind(metric.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(used)
    }

    /// Fails with `QuotaExceeded` when the caller has used up this month's allowance
    pub async fn check_quota(&self, user_id: Uuid, metric: Metric) -> Result<Tier, UsageError> {
        let tier = self.effective_tier(user_id).await?;
        if tier.limit(metric).is_none() {
            return Ok(tier);
        }

        let (start, _) = billing_period(Utc::now());
        let used = self.used_since(user_id, metric, start).await?;
        evaluate_quota(tier, metric, used)?;
        Ok(tier)
    }

    pub async fn record_usage(&self, user_id: Uuid, metric: Metric, quantity: i64) -> Result<(), UsageError> {
        sqlx::query("INSERT INTO usage_events (user_id, metric, quantity) VALUES ($1, $2, $3)")
            .bind(user_id)
            .bind(metric.as_str())
            .bind(quantity)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from)?;
        debug!("Recorded {} x{} for user {}", metric.as_str(), quantity, user_id);
        Ok(())
    }

    pub async fn summary(&self, user_id: Uuid) -> Result<UsageSummary, UsageError> {
        let tier = self.effective_tier(user_id).await?;
        let (period_start, period_end) = billing_period(Utc::now());

        let mut metrics = BTreeMap::new();
        for metric in Metric::ALL {
            let used = self.used_since(user_id, metric, period_start).await?;
            metrics.insert(metric.as_str(), MetricUsage::new(used, tier.limit(metric)));
        }

        Ok(UsageSummary {
            tier,
            period_start,
            period_end,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_limits() {
        assert_eq!(Tier::Free.limit(Metric::AiGeneration), Some(5));
        assert_eq!(Tier::Free.limit(Metric::SyncUpload), Some(50));
        assert_eq!(Tier::Pro.limit(Metric::AiGeneration), Some(200));
        assert_eq!(Tier::Pro.limit(Metric::SyncUpload), Some(2000));
        assert_eq!(Tier::Team.limit(Metric::AiGeneration), Some(1000));
        assert_eq!(Tier::Team.limit(Metric::SyncUpload), None);
    }

    #[test]
    fn tier_parse_is_lenient_about_case() {
        assert_eq!(Tier::parse("PRO"), Some(Tier::Pro));
        assert_eq!(Tier::parse(" team "), Some(Tier::Team));
        assert_eq!(Tier::parse("enterprise"), None);
    }

    #[test]
    fn quota_allows_until_limit() {
        assert!(evaluate_quota(Tier::Free, Metric::AiGeneration, 4).is_ok());
        match evaluate_quota(Tier::Free, Metric::AiGeneration, 5) {
            Err(UsageError::QuotaExceeded { metric, tier, used, limit }) => {
                assert_eq!(metric, "ai_generation");
                assert_eq!(tier, "free");
                assert_eq!((used, limit), (5, 5));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(evaluate_quota(Tier::Team, Metric::SyncUpload, 1_000_000).is_ok());
    }

    #[test]
    fn period_is_the_calendar_month() {
        let now = Utc.with_ymd_and_hms(2026, 3, 17, 13, 45, 0).unwrap();
        let (start, end) = billing_period(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn december_rolls_into_next_year() {
        let now = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap();
        let (start, end) = billing_period(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn remaining_never_goes_negative() {
        assert_eq!(MetricUsage::new(7, Some(5)).remaining, Some(0));
        assert_eq!(MetricUsage::new(2, Some(5)).remaining, Some(3));
        assert_eq!(MetricUsage::new(2, None).remaining, None);
    }
}
