//! Operation types flowing through the service pipeline.

use std::future::Future;
use std::pin::Pin;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hse_core::{Document, Filter, LimitClass, RequestContext, ResourceType, UsageReport};
use serde_json::json;

use crate::data::{FindQuery, Page};
use crate::error::TenancyError;
use crate::ratelimit::RateLimitResult;

/// Context carried with every operation through the pipeline.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub call_id: u64,
    /// Identity and tenancy of the caller. Bound task-locally by the
    /// tenant-context layer for the duration of the operation.
    pub request: RequestContext,
    /// Rate-limit budget this operation draws from.
    pub limit_class: LimitClass,
    pub call_timeout_ms: u64,
}

impl OperationContext {
    #[must_use]
    pub fn new(call_id: u64, request: RequestContext, call_timeout_ms: u64) -> Self {
        Self {
            call_id,
            request,
            limit_class: LimitClass::Api,
            call_timeout_ms,
        }
    }

    #[must_use]
    pub fn with_limit_class(mut self, class: LimitClass) -> Self {
        self.limit_class = class;
        self
    }
}

/// Typed operation variants dispatched through the pipeline.
#[derive(Debug)]
pub enum Operation {
    Create {
        ctx: OperationContext,
        entity: String,
        doc: Document,
        /// Deduplicates quota accounting on client retries.
        idempotency_key: Option<String>,
    },
    CreateMany {
        ctx: OperationContext,
        entity: String,
        docs: Vec<Document>,
    },
    Find {
        ctx: OperationContext,
        entity: String,
        query: FindQuery,
    },
    Count {
        ctx: OperationContext,
        entity: String,
        filter: Filter,
    },
    Update {
        ctx: OperationContext,
        entity: String,
        filter: Filter,
        patch: Document,
    },
    Delete {
        ctx: OperationContext,
        entity: String,
        filter: Filter,
    },
    GetUsage {
        ctx: OperationContext,
        resource: ResourceType,
    },
}

impl Operation {
    #[must_use]
    pub fn ctx(&self) -> &OperationContext {
        match self {
            Operation::Create { ctx, .. }
            | Operation::CreateMany { ctx, .. }
            | Operation::Find { ctx, .. }
            | Operation::Count { ctx, .. }
            | Operation::Update { ctx, .. }
            | Operation::Delete { ctx, .. }
            | Operation::GetUsage { ctx, .. } => ctx,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::CreateMany { .. } => "create_many",
            Operation::Find { .. } => "find",
            Operation::Count { .. } => "count",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::GetUsage { .. } => "get_usage",
        }
    }

    /// Entity the operation targets, if any.
    #[must_use]
    pub fn entity(&self) -> Option<&str> {
        match self {
            Operation::Create { entity, .. }
            | Operation::CreateMany { entity, .. }
            | Operation::Find { entity, .. }
            | Operation::Count { entity, .. }
            | Operation::Update { entity, .. }
            | Operation::Delete { entity, .. } => Some(entity),
            Operation::GetUsage { .. } => None,
        }
    }
}

/// Result payload of a successful operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutput {
    Created(Document),
    CreatedMany(Vec<Document>),
    Page(Page),
    Count(u64),
    /// Rows changed by an update or removed by a delete.
    Affected(Vec<Document>),
    Usage(UsageReport),
}

/// Successful response, with the rate-limit status that admitted it.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResponse {
    pub output: OperationOutput,
    pub rate_limit: Option<RateLimitResult>,
}

impl From<OperationOutput> for OperationResponse {
    fn from(output: OperationOutput) -> Self {
        Self {
            output,
            rate_limit: None,
        }
    }
}

/// Boxed future returned by every service in the pipeline.
pub type OperationFuture =
    Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

/// Errors returned by the operation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("server overloaded, try again later")]
    Overloaded,
    #[error(transparent)]
    Tenancy(#[from] TenancyError),
}

impl IntoResponse for OperationError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        let (status, code) = match self {
            OperationError::Tenancy(inner) => return inner.into_response(),
            OperationError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            OperationError::Overloaded => (StatusCode::SERVICE_UNAVAILABLE, "OVERLOADED"),
        };
        let body = Json(json!({
            "error": message,
            "code": code,
            "details": null,
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_defaults_to_api_class() {
        let ctx = OperationContext::new(1, RequestContext::anonymous("r"), 1000);
        assert_eq!(ctx.limit_class, LimitClass::Api);
        assert_eq!(
            ctx.with_limit_class(LimitClass::Export).limit_class,
            LimitClass::Export
        );
    }

    #[test]
    fn tenancy_errors_keep_their_status() {
        let err = OperationError::from(TenancyError::QuotaExceeded {
            resource: ResourceType::Audit,
            limit: 5,
            used: 5,
        });
        assert_eq!(err.into_response().status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(
            OperationError::Overloaded.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
