//! Per-tenant rate limiting for operations.
//!
//! Consumes one unit of the tenant's budget for the operation's limit class
//! before the inner service runs. Rejections short-circuit with
//! `RateLimitExceeded`; admitted responses carry the limiter status so the
//! HTTP surface can emit rate-limit headers.
//!
//! Operations without a bound tenant are not metered here: system overrides
//! are trusted platform paths, and anonymous callers are denied further down.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use crate::ratelimit::RateLimiter;
use crate::service::operation::{Operation, OperationError, OperationResponse};

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    #[must_use]
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> Service<Operation> for RateLimitService<S>
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
        let limiter = Arc::clone(&self.limiter);
        let request = &op.ctx().request;
        let tenant = request
            .tenant()
            .filter(|_| !request.is_system_override())
            .cloned();
        let class = op.ctx().limit_class;
        // Futures are lazy: the inner operation does not start until awaited.
        let fut = self.inner.call(op);

        Box::pin(async move {
            let Some(tenant) = tenant else {
                return fut.await;
            };
            let status = limiter
                .check_rate_limit(&tenant, class)
                .await?
                .into_result()?;
            let mut response = fut.await?;
            response.rate_limit = Some(status);
            Ok(response)
        })
    }
}
