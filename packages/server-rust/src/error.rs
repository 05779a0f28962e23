//! Error taxonomy for isolation and enforcement failures.
//!
//! Every variant maps to a distinct HTTP status and machine-readable code so
//! clients can tell a retryable rate limit from a plan-bound quota, and so
//! operators can alert on store outages separately from ordinary failures.

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hse_core::ResourceType;
use serde_json::json;

use crate::store::StoreError;

/// Errors raised by the tenancy core.
#[derive(Debug, thiserror::Error)]
pub enum TenancyError {
    /// Tenant-scoped operation attempted with no bound tenant and no override.
    #[error("no tenant context bound for {operation} on {entity}")]
    MissingTenantContext {
        entity: String,
        operation: &'static str,
    },
    /// Explicit reference to another tenant's rows without an override.
    #[error("cross-tenant access to {entity}: bound {bound}, requested {requested}")]
    CrossTenantAccess {
        entity: String,
        bound: String,
        requested: String,
    },
    #[error("rate limit of {limit} exceeded, retry after {}s", retry_after.as_secs())]
    RateLimitExceeded { limit: u64, retry_after: Duration },
    #[error("{resource} quota exhausted ({used}/{limit})")]
    QuotaExceeded {
        resource: ResourceType,
        limit: u64,
        used: u64,
    },
    #[error("not authorized for room {room}")]
    UnauthorizedRoomAccess { room: String },
    #[error("shared store unavailable: {0}")]
    SharedStoreUnavailable(#[from] StoreError),
    #[error("persistence error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl TenancyError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            TenancyError::MissingTenantContext { .. } => "MISSING_TENANT_CONTEXT",
            TenancyError::CrossTenantAccess { .. } => "CROSS_TENANT_ACCESS",
            TenancyError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            TenancyError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            TenancyError::UnauthorizedRoomAccess { .. } => "UNAUTHORIZED_ROOM_ACCESS",
            TenancyError::SharedStoreUnavailable(_) => "SHARED_STORE_UNAVAILABLE",
            TenancyError::Backend(_) => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            TenancyError::MissingTenantContext { .. }
            | TenancyError::CrossTenantAccess { .. }
            | TenancyError::UnauthorizedRoomAccess { .. } => StatusCode::FORBIDDEN,
            TenancyError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            TenancyError::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            TenancyError::SharedStoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            TenancyError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is an isolation violation.
    #[must_use]
    pub fn is_isolation_violation(&self) -> bool {
        matches!(
            self,
            TenancyError::MissingTenantContext { .. } | TenancyError::CrossTenantAccess { .. }
        )
    }

    fn details(&self) -> serde_json::Value {
        match self {
            TenancyError::RateLimitExceeded { limit, retry_after } => json!({
                "limit": limit,
                "retryAfter": retry_after.as_secs().max(1),
            }),
            TenancyError::QuotaExceeded {
                resource,
                limit,
                used,
            } => json!({
                "resource": resource,
                "limit": limit,
                "used": used,
                "remaining": 0,
            }),
            _ => serde_json::Value::Null,
        }
    }
}

impl IntoResponse for TenancyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal details of backend/store failures stay in the logs.
        let message = match &self {
            TenancyError::Backend(_) => "internal error".to_string(),
            TenancyError::SharedStoreUnavailable(_) => "service temporarily unavailable".to_string(),
            other => other.to_string(),
        };
        let body = Json(json!({
            "error": message,
            "code": self.code(),
            "details": self.details(),
        }));

        let mut response = (status, body).into_response();
        if let TenancyError::RateLimitExceeded { retry_after, .. } = &self {
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_distinct_for_rate_and_quota() {
        let rate = TenancyError::RateLimitExceeded {
            limit: 10,
            retry_after: Duration::from_secs(30),
        };
        let quota = TenancyError::QuotaExceeded {
            resource: ResourceType::Audit,
            limit: 5,
            used: 5,
        };
        assert_eq!(rate.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(quota.status_code(), StatusCode::PAYMENT_REQUIRED);
        assert_ne!(rate.code(), quota.code());
    }

    #[test]
    fn rate_limit_response_carries_retry_after() {
        let resp = TenancyError::RateLimitExceeded {
            limit: 10,
            retry_after: Duration::from_secs(42),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[http::header::RETRY_AFTER], "42");
    }

    #[test]
    fn retry_after_never_zero() {
        let resp = TenancyError::RateLimitExceeded {
            limit: 10,
            retry_after: Duration::from_millis(200),
        }
        .into_response();
        assert_eq!(resp.headers()[http::header::RETRY_AFTER], "1");
    }

    #[test]
    fn isolation_errors_fail_closed_with_403() {
        let err = TenancyError::MissingTenantContext {
            entity: "audit".into(),
            operation: "find",
        };
        assert!(err.is_isolation_violation());
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn store_outage_is_distinct() {
        let err = TenancyError::from(StoreError::Unavailable("connection refused".into()));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "SHARED_STORE_UNAVAILABLE");
    }
}
