//! Binds the operation's request context task-locally.
//!
//! Everything below this layer, including every `.await` inside the inner
//! service's future, observes the operation's tenant through
//! [`crate::context::current`]. The binding ends with the future, on every
//! exit path.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use crate::context::with_request_context;
use crate::service::operation::{Operation, OperationError, OperationResponse};

#[derive(Debug, Clone)]
pub struct TenantContextLayer;

impl<S> Layer<S> for TenantContextLayer {
    type Service = TenantContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TenantContextService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct TenantContextService<S> {
    inner: S,
}

impl<S> Service<Operation> for TenantContextService<S>
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
        let request = op.ctx().request.clone();
        let fut = self.inner.call(op);
        Box::pin(with_request_context(request, fut))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hse_core::{Principal, RequestContext, ResourceType, Role, TenantId};
    use tower::ServiceExt;

    use super::*;
    use crate::context;
    use crate::service::operation::{OperationContext, OperationOutput};

    /// Reports the number of characters of the tenant it observes after
    /// yielding, so a leaked or lost binding shows up as a wrong count.
    struct ObservingService;

    impl Service<Operation> for ObservingService {
        type Response = OperationResponse;
        type Error = OperationError;
        type Future =
            Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, op: Operation) -> Self::Future {
            let expected = op.ctx().request.tenant().cloned();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                assert_eq!(context::current_tenant(), expected);
                let len = expected.map_or(0, |t| t.as_str().len() as u64);
                Ok(OperationOutput::Count(len).into())
            })
        }
    }

    fn op_for(org: Option<&str>) -> Operation {
        let request = match org {
            Some(org) => RequestContext::for_principal(
                "r",
                Principal::new("u", TenantId::parse(org).unwrap(), Role::User),
            ),
            None => RequestContext::anonymous("r"),
        };
        Operation::GetUsage {
            ctx: OperationContext::new(1, request, 5000),
            resource: ResourceType::Audit,
        }
    }

    #[tokio::test]
    async fn binding_survives_await_and_never_crosses_operations() {
        let mut tasks = Vec::new();
        for i in 0..32 {
            let org = format!("org-{}", "x".repeat(i % 4 + 1));
            tasks.push(tokio::spawn(async move {
                TenantContextLayer
                    .layer(ObservingService)
                    .oneshot(op_for(Some(&org)))
                    .await
                    .map(|r| (org.len() as u64, r.output))
            }));
        }
        for t in tasks {
            let (len, output) = t.await.unwrap().unwrap();
            assert_eq!(output, OperationOutput::Count(len));
        }
        assert!(context::current().is_none());
    }

    #[tokio::test]
    async fn anonymous_operations_bind_no_tenant() {
        let resp = TenantContextLayer
            .layer(ObservingService)
            .oneshot(op_for(None))
            .await
            .unwrap();
        assert_eq!(resp.output, OperationOutput::Count(0));
    }
}
