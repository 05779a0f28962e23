//! Load shedding for operations.
//!
//! Two budgets are checked before any work starts: the process-wide
//! concurrency limit, and a per-tenant share of it so one busy organization
//! cannot take every permit from the others. Operations over either budget
//! fail fast with `OperationError::Overloaded`. Operations with no bound
//! tenant (system and anonymous) only count against the global budget.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hse_core::TenantId;
use tokio::sync::Semaphore;
use tower::{Layer, Service};
use tracing::debug;

use crate::service::operation::{Operation, OperationError, OperationResponse};

// ---------------------------------------------------------------------------
// Per-tenant slots
// ---------------------------------------------------------------------------

/// In-flight operation counts per tenant.
#[derive(Debug)]
struct TenantSlots {
    max_per_tenant: usize,
    in_flight: DashMap<TenantId, usize>,
}

impl TenantSlots {
    fn try_acquire(self: &Arc<Self>, tenant: &TenantId) -> Option<TenantSlot> {
        let mut count = self.in_flight.entry(tenant.clone()).or_insert(0);
        if *count >= self.max_per_tenant {
            return None;
        }
        *count += 1;
        Some(TenantSlot {
            slots: Arc::clone(self),
            tenant: tenant.clone(),
        })
    }

    fn in_flight(&self, tenant: &TenantId) -> usize {
        self.in_flight.get(tenant).map_or(0, |c| *c)
    }
}

/// Releases one tenant slot on drop. Idle tenants leave no entry behind.
#[derive(Debug)]
struct TenantSlot {
    slots: Arc<TenantSlots>,
    tenant: TenantId,
}

impl Drop for TenantSlot {
    fn drop(&mut self) {
        if let Entry::Occupied(mut occ) = self.slots.in_flight.entry(self.tenant.clone()) {
            let count = occ.get_mut();
            *count = count.saturating_sub(1);
            if *count == 0 {
                occ.remove();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer enforcing the global and per-tenant concurrency budgets.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
    tenants: Arc<TenantSlots>,
}

impl LoadShedLayer {
    /// `max_per_tenant` is clamped to `max_concurrent`.
    #[must_use]
    pub fn new(max_concurrent: u32, max_per_tenant: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
            tenants: Arc::new(TenantSlots {
                max_per_tenant: max_per_tenant.min(max_concurrent) as usize,
                in_flight: DashMap::new(),
            }),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: Arc::clone(&self.semaphore),
            tenants: Arc::clone(&self.tenants),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
    tenants: Arc<TenantSlots>,
}

impl<S> LoadShedService<S> {
    /// Operations currently admitted for `tenant`.
    #[must_use]
    pub fn tenant_in_flight(&self, tenant: &TenantId) -> usize {
        self.tenants.in_flight(tenant)
    }
}

fn shed(op: &Operation, scope: &'static str) -> Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>> {
    metrics::counter!("hse_operations_shed_total", "scope" => scope).increment(1);
    debug!(
        tenant_id = op.ctx().request.tenant().map(TenantId::as_str),
        operation = op.name(),
        scope,
        "operation shed"
    );
    Box::pin(async { Err(OperationError::Overloaded) })
}

impl<S> Service<Operation> for LoadShedService<S>
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let slot = match op.ctx().request.tenant() {
            Some(tenant) => match self.tenants.try_acquire(tenant) {
                Some(slot) => Some(slot),
                None => return shed(&op, "tenant"),
            },
            None => None,
        };
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            return shed(&op, "global");
        };

        let fut = self.inner.call(op);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            drop(slot);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hse_core::{Principal, RequestContext, ResourceType, Role};
    use tower::ServiceExt;

    use super::*;
    use crate::service::operation::{OperationContext, OperationOutput};

    /// Service that holds for a configurable duration.
    struct SlowService {
        delay_ms: u64,
    }

    impl Service<Operation> for SlowService {
        type Response = OperationResponse;
        type Error = OperationError;
        type Future =
            Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _op: Operation) -> Self::Future {
            let delay = self.delay_ms;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(OperationOutput::Count(0).into())
            })
        }
    }

    fn make_op() -> Operation {
        Operation::GetUsage {
            ctx: OperationContext::new(1, RequestContext::anonymous("r"), 5000),
            resource: ResourceType::Audit,
        }
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    fn tenant_op(org: &str) -> Operation {
        let request =
            RequestContext::for_principal("r", Principal::new("u", tenant(org), Role::Auditor));
        Operation::GetUsage {
            ctx: OperationContext::new(1, request, 5000),
            resource: ResourceType::Audit,
        }
    }

    #[tokio::test]
    async fn allows_operations_under_limit() {
        let layer = LoadShedLayer::new(10, 10);
        let svc = layer.layer(SlowService { delay_ms: 1 });
        let resp = svc.oneshot(make_op()).await.unwrap();
        assert_eq!(resp.output, OperationOutput::Count(0));
    }

    #[tokio::test]
    async fn rejects_when_overloaded() {
        let layer = LoadShedLayer::new(1, 1);
        let mut svc = layer.layer(SlowService { delay_ms: 500 });

        let _ = ServiceExt::ready(&mut svc).await.unwrap();
        let _in_flight = tokio::spawn({
            let fut = svc.call(make_op());
            async move { fut.await }
        });

        // Give the spawned task time to acquire the permit.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = svc.call(make_op()).await.unwrap_err();
        assert!(matches!(err, OperationError::Overloaded));
    }

    #[tokio::test]
    async fn busy_tenant_cannot_starve_others() {
        let layer = LoadShedLayer::new(10, 1);
        let mut svc = layer.layer(SlowService { delay_ms: 500 });

        let _ = ServiceExt::ready(&mut svc).await.unwrap();
        let held = tokio::spawn(svc.call(tenant_op("org-1")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(svc.tenant_in_flight(&tenant("org-1")), 1);

        let err = svc.call(tenant_op("org-1")).await.unwrap_err();
        assert!(matches!(err, OperationError::Overloaded));
        assert!(svc.call(tenant_op("org-2")).await.is_ok());
        assert!(svc.call(make_op()).await.is_ok());

        held.await.unwrap().unwrap();
        assert_eq!(svc.tenant_in_flight(&tenant("org-1")), 0);
        assert!(svc.call(tenant_op("org-1")).await.is_ok());
    }

    #[tokio::test]
    async fn tenant_share_is_clamped_to_global_limit() {
        let layer = LoadShedLayer::new(2, 50);
        let mut svc = layer.layer(SlowService { delay_ms: 500 });

        let _ = ServiceExt::ready(&mut svc).await.unwrap();
        let a = tokio::spawn(svc.call(tenant_op("org-1")));
        let b = tokio::spawn(svc.call(tenant_op("org-1")));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = svc.call(tenant_op("org-1")).await.unwrap_err();
        assert!(matches!(err, OperationError::Overloaded));
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
    }
}
