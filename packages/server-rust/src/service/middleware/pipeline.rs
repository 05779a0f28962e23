//! Pipeline composition: combines all middleware layers into a single service stack.

use std::sync::Arc;

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use super::rate_limit::{RateLimitLayer, RateLimitService};
use super::tenant_context::{TenantContextLayer, TenantContextService};
use super::timeout::{TimeoutLayer, TimeoutService};
use crate::ratelimit::RateLimiter;
use crate::service::config::ServiceConfig;
use crate::service::domain::RecordService;

/// The fully layered operation service.
pub type OperationPipeline = LoadShedService<
    TimeoutService<MetricsService<TenantContextService<RateLimitService<RecordService>>>>,
>;

/// Build the operation pipeline by wrapping the `RecordService` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when the process or the tenant is over its
///    concurrency budget (fail fast before doing any work)
/// 2. `TimeoutLayer` -- enforce per-operation timeouts
/// 3. `MetricsLayer` -- record timing and outcome
/// 4. `TenantContextLayer` -- bind the request context task-locally
/// 5. `RateLimitLayer` -- consume one unit of the tenant's budget
#[must_use]
pub fn build_operation_pipeline(
    records: RecordService,
    limiter: Arc<RateLimiter>,
    config: &ServiceConfig,
) -> OperationPipeline {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(
            config.max_concurrent_operations,
            config.max_concurrent_per_tenant,
        ))
        .layer(TimeoutLayer)
        .layer(MetricsLayer)
        .layer(TenantContextLayer)
        .layer(RateLimitLayer::new(limiter))
        .service(records)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use hse_core::{
        Document, LimitClass, Principal, RequestContext, Role, SubscriptionPlan, TenantId, Value,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::cache::{CacheConfig, CacheManager};
    use crate::data::{
        EntityRegistry, FindQuery, IsolationPolicy, MemoryBackend, TenantDataClient,
        TenantInterceptor,
    };
    use crate::error::TenancyError;
    use crate::plans::{PlanResolver, StaticPlanResolver};
    use crate::quota::{memory::MemoryLedger, QuotaTracker};
    use crate::ratelimit::RateLimitConfig;
    use crate::realtime::{ConnectionRegistry, RoomRouter};
    use crate::service::operation::{Operation, OperationContext, OperationError, OperationOutput};
    use crate::store::{MemoryStore, SharedStore};

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    fn pipeline() -> OperationPipeline {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let plans: Arc<dyn PlanResolver> = Arc::new(
            StaticPlanResolver::new()
                .with_plan(tenant("org-1"), SubscriptionPlan::Starter)
                .with_plan(tenant("org-2"), SubscriptionPlan::Starter),
        );
        let interceptor = TenantInterceptor::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(EntityRegistry::default()),
            IsolationPolicy::FailClosed,
        );
        let records = RecordService::new(
            TenantDataClient::new(Arc::new(interceptor)),
            QuotaTracker::new(Arc::new(MemoryLedger::new()), Arc::clone(&plans)),
            Arc::new(CacheManager::new(Arc::clone(&store), CacheConfig::default())),
            Arc::new(RoomRouter::new(Arc::new(ConnectionRegistry::new()), 5)),
        );
        let limiter = Arc::new(RateLimiter::new(store, plans, RateLimitConfig::default()));
        build_operation_pipeline(records, limiter, &ServiceConfig::default())
    }

    fn user(org: &str) -> RequestContext {
        RequestContext::for_principal("req", Principal::new("u", tenant(org), Role::Auditor))
    }

    #[tokio::test]
    async fn create_then_find_through_all_layers() {
        let svc = pipeline();
        let mut doc = Document::new();
        doc.insert("title".into(), Value::from("Pump inspection"));

        let created = svc
            .clone()
            .oneshot(Operation::Create {
                ctx: OperationContext::new(1, user("org-1"), 5_000),
                entity: "audit".into(),
                doc,
                idempotency_key: None,
            })
            .await
            .unwrap();
        assert!(created.rate_limit.is_some());

        let theirs = svc
            .oneshot(Operation::Find {
                ctx: OperationContext::new(2, user("org-2"), 5_000),
                entity: "audit".into(),
                query: FindQuery::default(),
            })
            .await
            .unwrap();
        let OperationOutput::Page(page) = theirs.output else {
            panic!("unexpected output");
        };
        assert!(page.items.is_empty());
    }

    #[tokio::test]
    async fn concurrent_auth_operations_admit_exactly_the_budget() {
        let svc = pipeline();
        let mut tasks = Vec::new();
        for i in 0..100 {
            let svc = svc.clone();
            tasks.push(tokio::spawn(async move {
                svc.oneshot(Operation::Count {
                    ctx: OperationContext::new(i, user("org-2"), 5_000)
                        .with_limit_class(LimitClass::Auth),
                    entity: "user".into(),
                    filter: hse_core::Filter::All,
                })
                .await
            }));
        }

        let (mut admitted, mut rejected) = (0, 0);
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(OperationError::Tenancy(TenancyError::RateLimitExceeded { retry_after, .. })) => {
                    assert!(!retry_after.is_zero());
                    rejected += 1;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        // Starter tier: ten authentication-class requests per window.
        assert_eq!((admitted, rejected), (10, 90));
    }
}
