// ============================================================================
// Rate Limiter
// ============================================================================
//
// Fixed-window counter keyed by tier x identity x window start, backed by
// the shared counter store. The read-then-increment sequence is deliberately
// not a single atomic step: under contention the effective limit can be
// exceeded by at most one request per concurrent caller inside one window,
// which the external contract accepts.
//
// Store failures never reject a request: the limiter fails open, reports
// `remaining = -1`, and logs the failure.
//
// ============================================================================

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue};
use chrono::Utc;
use serde::Serialize;

use crate::config::{RateLimitSettings, DEFAULT_TIER};
use crate::error::{GatewayError, GatewayResult};
use crate::store::CounterStore;

const KEY_PREFIX: &str = "rate_limit";

/// Outcome of one limiter decision, also the source for the
/// `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: i64,
    /// Requests left in the window; `-1` when the store was unreachable and
    /// the request was admitted fail-open.
    pub remaining: i64,
    #[serde(rename = "resetTime")]
    pub reset_epoch_secs: i64,
    pub tier: String,
}

impl RateLimitDecision {
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(
            "x-ratelimit-limit",
            HeaderValue::from_str(&self.limit.to_string()).unwrap_or(HeaderValue::from_static("0")),
        );
        headers.insert(
            "x-ratelimit-remaining",
            HeaderValue::from_str(&self.remaining.to_string())
                .unwrap_or(HeaderValue::from_static("0")),
        );
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from_str(&self.reset_epoch_secs.to_string())
                .unwrap_or(HeaderValue::from_static("0")),
        );
        if let Ok(value) = HeaderValue::from_str(&self.tier) {
            headers.insert("x-ratelimit-tier", value);
        }
    }
}

/// Current usage for an identity in its active window, for the admin surface.
#[derive(Debug, Serialize)]
pub struct RateLimitStatus {
    pub tier: String,
    pub identity: String,
    pub limit: i64,
    pub used: i64,
    pub remaining: i64,
    #[serde(rename = "resetTime")]
    pub reset_epoch_secs: i64,
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, settings: RateLimitSettings) -> Self {
        Self { store, settings }
    }

    /// Effective tier for a request: the authenticated user's tier when
    /// present, else the route's tier, else the default.
    pub fn effective_tier<'a>(
        user_tier: Option<&'a str>,
        route_tier: Option<&'a str>,
    ) -> &'a str {
        user_tier.or(route_tier).unwrap_or(DEFAULT_TIER)
    }

    /// Debit one request from the identity's window.
    pub async fn check(&self, identity: &str, tier_name: &str) -> RateLimitDecision {
        let tier = self.settings.tier(tier_name);
        let now_ms = Utc::now().timestamp_millis();
        let window_start = (now_ms / tier.window_ms) * tier.window_ms;
        let reset_epoch_secs = (window_start + tier.window_ms) / 1000;
        let key = counter_key(tier_name, identity, window_start);

        match self
            .try_debit(&key, tier.requests, tier.window_ms)
            .await
        {
            Ok(remaining) => RateLimitDecision {
                allowed: remaining.is_some(),
                limit: tier.requests,
                remaining: remaining.unwrap_or(0),
                reset_epoch_secs,
                tier: tier_name.to_string(),
            },
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    identity = %identity,
                    tier = %tier_name,
                    "counter store unavailable, failing open"
                );
                RateLimitDecision {
                    allowed: true,
                    limit: tier.requests,
                    remaining: -1,
                    reset_epoch_secs,
                    tier: tier_name.to_string(),
                }
            }
        }
    }

    /// `Ok(Some(remaining))` when admitted, `Ok(None)` when over the limit.
    async fn try_debit(
        &self,
        key: &str,
        limit: i64,
        window_ms: i64,
    ) -> Result<Option<i64>, crate::store::StoreError> {
        let count = self.store.get_count(key).await?.unwrap_or(0);
        if count >= limit {
            return Ok(None);
        }
        let ttl_secs = (window_ms + 999) / 1000;
        let new_count = self.store.incr_with_expiry(key, ttl_secs).await?;
        Ok(Some((limit - new_count).max(0)))
    }

    /// Admin: usage in the identity's current window.
    pub async fn status(&self, identity: &str, tier_name: &str) -> GatewayResult<RateLimitStatus> {
        let tier = self.settings.tier(tier_name);
        let now_ms = Utc::now().timestamp_millis();
        let window_start = (now_ms / tier.window_ms) * tier.window_ms;
        let key = counter_key(tier_name, identity, window_start);

        let used = self
            .store
            .get_count(&key)
            .await
            .map_err(|e| GatewayError::Internal(format!("counter store error: {}", e)))?
            .unwrap_or(0);

        Ok(RateLimitStatus {
            tier: tier_name.to_string(),
            identity: identity.to_string(),
            limit: tier.requests,
            used,
            remaining: (tier.requests - used).max(0),
            reset_epoch_secs: (window_start + tier.window_ms) / 1000,
        })
    }

    /// Admin: drop every counter for the identity in this tier, across all
    /// active windows.
    pub async fn reset(&self, identity: &str, tier_name: &str) -> GatewayResult<u64> {
        let pattern = format!("{}:{}:{}:*", KEY_PREFIX, tier_name, identity);
        self.store
            .delete_pattern(&pattern)
            .await
            .map_err(|e| GatewayError::Internal(format!("counter store error: {}", e)))
    }
}

fn counter_key(tier: &str, identity: &str, window_start: i64) -> String {
    format!("{}:{}:{}:{}", KEY_PREFIX, tier, identity, window_start)
}
