//! Task-local tenant context propagation.
//!
//! The active [`RequestContext`] is stored in a tokio task-local for the
//! duration of one future. The binding survives every `.await` inside that
//! future, is invisible to every other task, and is removed when the future
//! completes, errors, panics, or is dropped (cancelled). There is no global
//! mutable "current tenant".
//!
//! Spawned tasks do not inherit the binding. Use [`spawn_scoped`] to carry it
//! explicitly.

use std::future::Future;

use hse_core::{RequestContext, TenantId};
use tokio::task::JoinHandle;

tokio::task_local! {
    static CURRENT: RequestContext;
}

/// Runs `fut` with `ctx` bound as the current request context.
pub async fn with_request_context<F>(ctx: RequestContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(ctx, fut).await
}

/// Runs `fut` with `tenant_id` bound and no principal.
pub async fn with_tenant_context<F>(tenant_id: TenantId, fut: F) -> F::Output
where
    F: Future,
{
    let ctx = RequestContext::for_tenant(uuid::Uuid::new_v4().to_string(), tenant_id);
    with_request_context(ctx, fut).await
}

/// Clone of the current request context, if one is bound.
#[must_use]
pub fn current() -> Option<RequestContext> {
    CURRENT.try_with(Clone::clone).ok()
}

/// The tenant bound to the current task, if any. `None` means deny for
/// tenant-scoped resources.
#[must_use]
pub fn current_tenant() -> Option<TenantId> {
    CURRENT
        .try_with(|ctx| ctx.tenant().cloned())
        .ok()
        .flatten()
}

/// Spawns `fut` on the runtime with the current context (if any) re-bound
/// inside the new task.
pub fn spawn_scoped<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current() {
        Some(ctx) => tokio::spawn(CURRENT.scope(ctx, fut)),
        None => tokio::spawn(fut),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hse_core::{Principal, Role};

    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn nothing_bound_outside_scope() {
        assert!(current().is_none());
        assert!(current_tenant().is_none());
    }

    #[tokio::test]
    async fn binding_survives_suspension() {
        let seen = with_tenant_context(tenant("org-1"), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            tokio::task::yield_now().await;
            current_tenant()
        })
        .await;
        assert_eq!(seen, Some(tenant("org-1")));
        assert!(current_tenant().is_none(), "binding must be cleared after scope");
    }

    #[tokio::test]
    async fn cleared_on_error_path() {
        let result: Result<(), &str> =
            with_tenant_context(tenant("org-1"), async { Err("boom") }).await;
        assert!(result.is_err());
        assert!(current_tenant().is_none());
    }

    #[tokio::test]
    async fn cleared_on_panic() {
        let handle = tokio::spawn(async {
            with_tenant_context(tenant("org-1"), async {
                panic!("handler failed");
            })
            .await;
        });
        assert!(handle.await.is_err());
        assert!(current_tenant().is_none());
    }

    #[tokio::test]
    async fn nested_scope_restores_outer() {
        with_tenant_context(tenant("outer"), async {
            with_tenant_context(tenant("inner"), async {
                assert_eq!(current_tenant(), Some(tenant("inner")));
            })
            .await;
            assert_eq!(current_tenant(), Some(tenant("outer")));
        })
        .await;
    }

    #[tokio::test]
    async fn spawn_scoped_carries_binding_and_plain_spawn_does_not() {
        with_tenant_context(tenant("org-5"), async {
            let carried = spawn_scoped(async { current_tenant() }).await.unwrap();
            assert_eq!(carried, Some(tenant("org-5")));

            let plain = tokio::spawn(async { current_tenant() }).await.unwrap();
            assert!(plain.is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn principal_context_is_visible() {
        let p = Principal::new("u-1", tenant("org-9"), Role::Manager);
        let ctx = RequestContext::for_principal("req-9", p.clone());
        with_request_context(ctx, async move {
            let seen = current().unwrap();
            assert_eq!(seen.principal(), Some(&p));
            assert_eq!(seen.request_id, "req-9");
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tasks_never_observe_each_other() {
        let mut handles = Vec::new();
        for i in 0..64 {
            handles.push(tokio::spawn(async move {
                let me = tenant(&format!("org-{i}"));
                with_tenant_context(me.clone(), async move {
                    for _ in 0..20 {
                        tokio::task::yield_now().await;
                        assert_eq!(current_tenant().as_ref(), Some(&me));
                    }
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }
}
