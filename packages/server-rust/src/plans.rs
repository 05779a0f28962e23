//! Tenant → subscription tier lookup.
//!
//! Only the tier is cached in-process. Remaining rate-limit budget and quota
//! usage are always read from the shared store / ledger.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use hse_core::{SubscriptionPlan, TenantId};
use quick_cache::sync::Cache;
use tracing::warn;

/// Source of truth for a tenant's subscription tier (billing system,
/// organizations table).
///
/// Used as `Arc<dyn PlanResolver>`.
#[async_trait]
pub trait PlanResolver: Send + Sync {
    /// The tenant's tier, or `None` if the tenant has no known plan.
    async fn resolve(&self, tenant: &TenantId) -> anyhow::Result<Option<SubscriptionPlan>>;
}

/// Resolves a tier, falling back to the most restrictive one when the lookup
/// fails or finds nothing.
pub async fn resolve_or_fallback(resolver: &dyn PlanResolver, tenant: &TenantId) -> SubscriptionPlan {
    match resolver.resolve(tenant).await {
        Ok(Some(plan)) => plan,
        Ok(None) => {
            warn!(tenant_id = %tenant, "no plan on record, applying fallback tier");
            SubscriptionPlan::FALLBACK
        }
        Err(e) => {
            warn!(tenant_id = %tenant, error = %e, "plan lookup failed, applying fallback tier");
            SubscriptionPlan::FALLBACK
        }
    }
}

/// In-memory plan table. Used in tests and as a static override source.
#[derive(Debug, Default)]
pub struct StaticPlanResolver {
    plans: DashMap<TenantId, SubscriptionPlan>,
}

impl StaticPlanResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_plan(&self, tenant: TenantId, plan: SubscriptionPlan) {
        self.plans.insert(tenant, plan);
    }

    #[must_use]
    pub fn with_plan(self, tenant: TenantId, plan: SubscriptionPlan) -> Self {
        self.set_plan(tenant, plan);
        self
    }
}

#[async_trait]
impl PlanResolver for StaticPlanResolver {
    async fn resolve(&self, tenant: &TenantId) -> anyhow::Result<Option<SubscriptionPlan>> {
        Ok(self.plans.get(tenant).map(|p| *p.value()))
    }
}

/// Bounded, TTL-checked cache in front of another resolver.
///
/// Lookup failures are not cached, so a transient outage of the source only
/// costs the fallback tier until the next successful lookup.
pub struct CachedPlanResolver {
    inner: Arc<dyn PlanResolver>,
    cache: Cache<TenantId, (SubscriptionPlan, Instant)>,
    ttl: Duration,
}

impl CachedPlanResolver {
    #[must_use]
    pub fn new(inner: Arc<dyn PlanResolver>, capacity: usize, ttl: Duration) -> Self {
        Self {
            inner,
            cache: Cache::new(capacity),
            ttl,
        }
    }

    /// Drops the cached tier for `tenant` (e.g., after a plan change).
    pub fn invalidate(&self, tenant: &TenantId) {
        self.cache.remove(tenant);
    }
}

#[async_trait]
impl PlanResolver for CachedPlanResolver {
    async fn resolve(&self, tenant: &TenantId) -> anyhow::Result<Option<SubscriptionPlan>> {
        if let Some((plan, at)) = self.cache.get(tenant) {
            if at.elapsed() < self.ttl {
                return Ok(Some(plan));
            }
        }
        let resolved = self.inner.resolve(tenant).await?;
        if let Some(plan) = resolved {
            self.cache.insert(tenant.clone(), (plan, Instant::now()));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    struct CountingResolver {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl PlanResolver for CountingResolver {
        async fn resolve(&self, _tenant: &TenantId) -> anyhow::Result<Option<SubscriptionPlan>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("billing service down");
            }
            Ok(Some(SubscriptionPlan::Professional))
        }
    }

    #[tokio::test]
    async fn unknown_tenant_gets_fallback() {
        let resolver = StaticPlanResolver::new();
        assert_eq!(
            resolve_or_fallback(&resolver, &tenant("nobody")).await,
            SubscriptionPlan::FALLBACK
        );
    }

    #[tokio::test]
    async fn failing_lookup_gets_fallback() {
        let resolver = CountingResolver {
            calls: AtomicU32::new(0),
            fail: true,
        };
        assert_eq!(
            resolve_or_fallback(&resolver, &tenant("org-1")).await,
            SubscriptionPlan::Free
        );
    }

    #[tokio::test]
    async fn cache_serves_repeat_lookups() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let cached = CachedPlanResolver::new(inner.clone(), 16, Duration::from_secs(60));
        for _ in 0..5 {
            assert_eq!(
                cached.resolve(&tenant("org-1")).await.unwrap(),
                Some(SubscriptionPlan::Professional)
            );
        }
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        cached.invalidate(&tenant("org-1"));
        cached.resolve(&tenant("org-1")).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_ttl_always_revalidates() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let cached = CachedPlanResolver::new(inner.clone(), 16, Duration::ZERO);
        cached.resolve(&tenant("org-1")).await.unwrap();
        cached.resolve(&tenant("org-1")).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
