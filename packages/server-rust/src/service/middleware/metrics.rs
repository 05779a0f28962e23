//! Metrics middleware for operations.
//!
//! Wraps each operation in a `tracing` span carrying tenant and entity, and
//! records duration and outcome through the `metrics` facade.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::operation::{Operation, OperationError, OperationResponse};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records operation duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

/// Outcome label: `ok`, or the machine-readable error code.
fn outcome_label(result: &Result<OperationResponse, OperationError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(OperationError::Tenancy(e)) => e.code(),
        Err(OperationError::Timeout { .. }) => "TIMEOUT",
        Err(OperationError::Overloaded) => "OVERLOADED",
    }
}

impl<S> Service<Operation> for MetricsService<S>
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
        let name = op.name();
        let call_id = op.ctx().call_id;
        let span = info_span!(
            "operation",
            operation = name,
            call_id,
            request_id = %op.ctx().request.request_id,
            tenant_id = op.ctx().request.tenant().map_or("-", |t| t.as_str()),
            entity = op.entity().unwrap_or("-"),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(op);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome_label(&result);

                let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::counter!("hse_operations_total", "operation" => name, "outcome" => outcome)
                    .increment(1);
                metrics::histogram!("hse_operation_duration_seconds", "operation" => name)
                    .record(elapsed.as_secs_f64());

                tracing::debug!(
                    operation = name,
                    call_id,
                    duration_ms,
                    outcome,
                    "operation complete"
                );

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use hse_core::{RequestContext, ResourceType};
    use tower::ServiceExt;

    use super::*;
    use crate::error::TenancyError;
    use crate::service::operation::{OperationContext, OperationOutput};

    /// Immediately-completing service; fails for anonymous callers.
    struct ImmediateService;

    impl Service<Operation> for ImmediateService {
        type Response = OperationResponse;
        type Error = OperationError;
        type Future =
            Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, op: Operation) -> Self::Future {
            let call_id = op.ctx().call_id;
            Box::pin(async move {
                if call_id == 0 {
                    return Err(TenancyError::MissingTenantContext {
                        entity: "audit".into(),
                        operation: "find",
                    }
                    .into());
                }
                Ok(OperationOutput::Count(call_id).into())
            })
        }
    }

    fn op(call_id: u64) -> Operation {
        Operation::GetUsage {
            ctx: OperationContext::new(call_id, RequestContext::anonymous("r"), 5000),
            resource: ResourceType::Audit,
        }
    }

    #[tokio::test]
    async fn metrics_layer_passes_through_response() {
        let resp = MetricsLayer.layer(ImmediateService).oneshot(op(42)).await.unwrap();
        assert_eq!(resp.output, OperationOutput::Count(42));
    }

    #[tokio::test]
    async fn metrics_layer_passes_through_errors() {
        let result = MetricsLayer.layer(ImmediateService).oneshot(op(0)).await;
        assert_eq!(outcome_label(&result), "MISSING_TENANT_CONTEXT");
    }
}
