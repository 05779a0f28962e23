//! Distributed per-tenant rate limiting.
//!
//! Fixed windows aligned to the epoch: every instance derives the same window
//! key from the wall clock, so the counter in the shared store is the single
//! source of truth for the window. Admission is one atomic
//! [`SharedStore::hit_window`] call, never a read followed by a write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use hse_core::{LimitClass, TenantId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::TenancyError;
use crate::plans::{resolve_or_fallback, PlanResolver};
use crate::store::SharedStore;

/// What to do when the shared store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StoreFailurePolicy {
    /// Reject with `SharedStoreUnavailable` (503).
    #[default]
    #[value(name = "closed", alias = "fail-closed")]
    FailClosed,
    /// Admit the request unmetered and record a degraded decision.
    #[value(name = "open", alias = "fail-open")]
    FailOpen,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Window length. Plan limits are expressed per this window.
    pub window: Duration,
    pub failure_policy: StoreFailurePolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            failure_policy: StoreFailurePolicy::FailClosed,
        }
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed {
        limit: u64,
        remaining: u64,
        reset_at: DateTime<Utc>,
        /// Admitted without metering because the store was unreachable.
        degraded: bool,
    },
    Rejected {
        limit: u64,
        retry_after: Duration,
    },
}

impl RateLimitResult {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }

    /// Converts a rejection into [`TenancyError::RateLimitExceeded`].
    ///
    /// # Errors
    ///
    /// Returns the error when this result is `Rejected`.
    pub fn into_result(self) -> Result<RateLimitResult, TenancyError> {
        match self {
            RateLimitResult::Rejected { limit, retry_after } => {
                Err(TenancyError::RateLimitExceeded { limit, retry_after })
            }
            allowed @ RateLimitResult::Allowed { .. } => Ok(allowed),
        }
    }
}

/// Start and end (epoch ms) of the window containing `now`, and the time left in it.
fn window_bounds(now: DateTime<Utc>, window: Duration) -> (i64, i64, Duration) {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1);
    let now_ms = now.timestamp_millis();
    let start = now_ms.div_euclid(window_ms) * window_ms;
    let end = start.saturating_add(window_ms);
    let left = (end - now_ms).max(1);
    (start, end, Duration::from_millis(left.unsigned_abs()))
}

fn window_key(tenant: &TenantId, class: LimitClass, window: Duration, start_ms: i64) -> String {
    format!("rl:{tenant}:{}:{}:{start_ms}", class.as_str(), window.as_secs())
}

/// Per-tenant, per-class admission control backed by a [`SharedStore`].
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    plans: Arc<dyn PlanResolver>,
    config: RateLimitConfig,
}

impl RateLimiter {
    #[must_use]
    pub fn new(
        store: Arc<dyn SharedStore>,
        plans: Arc<dyn PlanResolver>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            store,
            plans,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Checks and consumes one unit of `tenant`'s budget for `class`.
    ///
    /// A rejection is returned as `Ok(Rejected)` so callers can emit headers;
    /// use [`RateLimitResult::into_result`] to turn it into an error.
    ///
    /// # Errors
    ///
    /// Returns [`TenancyError::SharedStoreUnavailable`] when the store fails
    /// and the policy is fail-closed.
    pub async fn check_rate_limit(
        &self,
        tenant: &TenantId,
        class: LimitClass,
    ) -> Result<RateLimitResult, TenancyError> {
        self.check_at(tenant, class, Utc::now()).await
    }

    /// Same as [`check_rate_limit`](Self::check_rate_limit), with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`check_rate_limit`](Self::check_rate_limit).
    pub async fn check_at(
        &self,
        tenant: &TenantId,
        class: LimitClass,
        now: DateTime<Utc>,
    ) -> Result<RateLimitResult, TenancyError> {
        let plan = resolve_or_fallback(self.plans.as_ref(), tenant).await;
        let limit = plan.rate_limit(class);
        let window = self.config.window;
        let (start_ms, end_ms, left) = window_bounds(now, window);
        let key = window_key(tenant, class, window, start_ms);

        let hit = match self.store.hit_window(&key, limit, left).await {
            Ok(hit) => hit,
            Err(e) => return self.on_store_failure(tenant, class, limit, now, left, e),
        };

        if hit.accepted {
            let reset_at = Utc.timestamp_millis_opt(end_ms).single().unwrap_or(now);
            Ok(RateLimitResult::Allowed {
                limit,
                remaining: limit.saturating_sub(hit.count),
                reset_at,
                degraded: false,
            })
        } else {
            // Store TTL is authoritative when it disagrees with the local clock.
            let retry_after = if hit.ttl.is_zero() { left } else { hit.ttl };
            metrics::counter!(
                "hse_rate_limit_rejections_total",
                "class" => class.as_str(),
                "plan" => plan.as_str(),
            )
            .increment(1);
            debug!(
                tenant_id = %tenant,
                class = %class,
                limit,
                retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                "rate limit exceeded"
            );
            Ok(RateLimitResult::Rejected { limit, retry_after })
        }
    }

    fn on_store_failure(
        &self,
        tenant: &TenantId,
        class: LimitClass,
        limit: u64,
        now: DateTime<Utc>,
        left: Duration,
        err: crate::store::StoreError,
    ) -> Result<RateLimitResult, TenancyError> {
        metrics::counter!("hse_shared_store_errors_total", "op" => "hit_window").increment(1);
        error!(tenant_id = %tenant, class = %class, error = %err, "rate limit store unavailable");
        match self.config.failure_policy {
            StoreFailurePolicy::FailClosed => Err(TenancyError::SharedStoreUnavailable(err)),
            StoreFailurePolicy::FailOpen => {
                warn!(tenant_id = %tenant, class = %class, "admitting request unmetered (fail-open)");
                Ok(RateLimitResult::Allowed {
                    limit,
                    remaining: limit,
                    reset_at: now + chrono::Duration::from_std(left).unwrap_or(chrono::Duration::zero()),
                    degraded: true,
                })
            }
        }
    }
}
