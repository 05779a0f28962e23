//! Tenant record and usage endpoints.
//!
//! Every request becomes one [`Operation`] dispatched through the operation
//! pipeline, which binds the caller's tenant, meters the rate-limit budget
//! and, for creates, enforces the plan quota. Handlers never touch the data
//! layer directly.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hse_core::{Document, Filter, LimitClass, RequestContext, ResourceType};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceExt;

use super::AppState;
use crate::auth::Authenticated;
use crate::data::FindQuery;
use crate::error::TenancyError;
use crate::ratelimit::RateLimitResult;
use crate::service::{Operation, OperationContext, OperationError, OperationOutput, OperationResponse};

const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const IDEMPOTENCY_KEY: HeaderName = HeaderName::from_static("idempotency-key");
const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

// ---------------------------------------------------------------------------
// Request bodies and parameters
// ---------------------------------------------------------------------------

/// A single document or an array of them. Arrays are created in bulk and
/// metered against the quota as one request for N units.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CreateBody {
    Many(Vec<Document>),
    One(Document),
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    /// JSON-encoded [`Filter`].
    pub filter: Option<String>,
    /// Bulk read for report generation, metered against the export budget.
    #[serde(default)]
    pub export: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CountParams {
    pub filter: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateBody {
    #[serde(default)]
    pub filter: Filter,
    pub patch: Document,
}

#[derive(Debug, Deserialize)]
pub struct DeleteBody {
    pub filter: Filter,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Operation(#[from] OperationError),
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        match self {
            RequestError::Invalid(_) => {
                let body = Json(json!({
                    "error": self.to_string(),
                    "code": "INVALID_REQUEST",
                    "details": null,
                }));
                (StatusCode::BAD_REQUEST, body).into_response()
            }
            RequestError::Operation(err) => {
                let limit = match &err {
                    OperationError::Tenancy(TenancyError::RateLimitExceeded { limit, .. }) => {
                        Some(*limit)
                    }
                    _ => None,
                };
                let mut response = err.into_response();
                if let Some(limit) = limit {
                    let headers = response.headers_mut();
                    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
                    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(0u64));
                }
                response
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch helpers
// ---------------------------------------------------------------------------

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string)
}

fn operation_context(
    state: &AppState,
    principal: hse_core::Principal,
    headers: &HeaderMap,
    class: LimitClass,
) -> OperationContext {
    let request = RequestContext::for_principal(request_id(headers), principal);
    OperationContext::new(state.next_call_id(), request, state.operation_timeout_ms)
        .with_limit_class(class)
}

fn parse_filter(raw: Option<&str>) -> Result<Filter, RequestError> {
    match raw {
        None => Ok(Filter::All),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| RequestError::Invalid(format!("filter: {e}"))),
    }
}

async fn dispatch(state: &AppState, op: Operation) -> Result<OperationResponse, RequestError> {
    Ok(state.operations.clone().oneshot(op).await?)
}

fn rate_limit_headers(status: Option<&RateLimitResult>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(RateLimitResult::Allowed {
        limit,
        remaining,
        reset_at,
        ..
    }) = status
    {
        headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(*limit));
        headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(*remaining));
        headers.insert(RATE_LIMIT_RESET, HeaderValue::from(reset_at.timestamp()));
    }
    headers
}

fn respond(status: StatusCode, response: OperationResponse) -> Response {
    let headers = rate_limit_headers(response.rate_limit.as_ref());
    let body = match response.output {
        OperationOutput::Created(doc) => json!(doc),
        OperationOutput::CreatedMany(docs) => json!({ "items": docs }),
        OperationOutput::Page(page) => json!(page),
        OperationOutput::Count(count) => json!({ "count": count }),
        OperationOutput::Affected(docs) => json!({ "affected": docs.len(), "items": docs }),
        OperationOutput::Usage(report) => json!(report),
    };
    (status, headers, Json(body)).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /api/v1/records/{entity}`
pub async fn create_handler(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(entity): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Result<Response, RequestError> {
    let op = match body {
        CreateBody::One(doc) => Operation::Create {
            ctx: operation_context(&state, principal, &headers, LimitClass::Api),
            entity,
            doc,
            idempotency_key: headers
                .get(IDEMPOTENCY_KEY)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        },
        CreateBody::Many(docs) => Operation::CreateMany {
            ctx: operation_context(&state, principal, &headers, LimitClass::Upload),
            entity,
            docs,
        },
    };
    let response = dispatch(&state, op).await?;
    Ok(respond(StatusCode::CREATED, response))
}

/// `GET /api/v1/records/{entity}?limit=&cursor=&filter=&export=`
pub async fn list_handler(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(entity): Path<String>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
) -> Result<Response, RequestError> {
    let class = if params.export {
        LimitClass::Export
    } else {
        LimitClass::Api
    };
    let query = FindQuery {
        filter: parse_filter(params.filter.as_deref())?,
        limit: params.limit,
        cursor: params.cursor,
        include: Vec::new(),
    };
    let op = Operation::Find {
        ctx: operation_context(&state, principal, &headers, class),
        entity,
        query,
    };
    let response = dispatch(&state, op).await?;
    Ok(respond(StatusCode::OK, response))
}

/// `GET /api/v1/records/{entity}/count?filter=`
pub async fn count_handler(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(entity): Path<String>,
    Query(params): Query<CountParams>,
    headers: HeaderMap,
) -> Result<Response, RequestError> {
    let op = Operation::Count {
        ctx: operation_context(&state, principal, &headers, LimitClass::Api),
        entity,
        filter: parse_filter(params.filter.as_deref())?,
    };
    let response = dispatch(&state, op).await?;
    Ok(respond(StatusCode::OK, response))
}

/// `PATCH /api/v1/records/{entity}`
pub async fn update_handler(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(entity): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpdateBody>,
) -> Result<Response, RequestError> {
    let op = Operation::Update {
        ctx: operation_context(&state, principal, &headers, LimitClass::Api),
        entity,
        filter: body.filter,
        patch: body.patch,
    };
    let response = dispatch(&state, op).await?;
    Ok(respond(StatusCode::OK, response))
}

/// `DELETE /api/v1/records/{entity}` with a filter body. An empty filter is
/// not defaulted: deleting everything must be asked for with `{"op":"all"}`.
pub async fn delete_handler(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(entity): Path<String>,
    headers: HeaderMap,
    Json(body): Json<DeleteBody>,
) -> Result<Response, RequestError> {
    let op = Operation::Delete {
        ctx: operation_context(&state, principal, &headers, LimitClass::Api),
        entity,
        filter: body.filter,
    };
    let response = dispatch(&state, op).await?;
    Ok(respond(StatusCode::OK, response))
}

/// `GET /api/v1/usage/{resource}`
pub async fn usage_handler(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(resource): Path<String>,
    headers: HeaderMap,
) -> Result<Response, RequestError> {
    let resource: ResourceType = resource
        .parse()
        .map_err(|e: hse_core::plan::UnknownVariant| RequestError::Invalid(e.to_string()))?;
    let op = Operation::GetUsage {
        ctx: operation_context(&state, principal, &headers, LimitClass::Api),
        resource,
    };
    let response = dispatch(&state, op).await?;
    Ok(respond(StatusCode::OK, response))
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use hse_core::{Principal, Role, Value};

    use super::*;
    use crate::network::handlers::test_support::{app_state, tenant};

    fn auditor(org: &str) -> Authenticated {
        Authenticated(Principal::new(format!("u-{org}"), tenant(org), Role::Auditor))
    }

    fn audit(title: &str) -> Document {
        let mut doc = Document::new();
        doc.insert("title".into(), Value::from(title));
        doc
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(state: &AppState, org: &str, title: &str) -> Response {
        create_handler(
            State(state.clone()),
            auditor(org),
            Path("audit".into()),
            HeaderMap::new(),
            Json(CreateBody::One(audit(title))),
        )
        .await
        .unwrap_or_else(IntoResponse::into_response)
    }

    #[tokio::test]
    async fn create_stamps_tenant_and_sets_rate_limit_headers() {
        let state = app_state();
        let response = create(&state, "org-1", "Forecourt").await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[RATE_LIMIT_LIMIT], "300");
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING], "299");
        assert!(response.headers().contains_key(RATE_LIMIT_RESET));

        let body = body_json(response).await;
        assert_eq!(body["organization_id"], "org-1");
        assert_eq!(body["title"], "Forecourt");
    }

    #[tokio::test]
    async fn list_shows_only_callers_rows() {
        let state = app_state();
        create(&state, "org-1", "mine").await;
        create(&state, "org-2", "theirs").await;

        let response = list_handler(
            State(state),
            auditor("org-2"),
            Path("audit".into()),
            Query(ListParams::default()),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        let body = body_json(response).await;
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["title"], "theirs");
    }

    #[tokio::test]
    async fn quota_exhaustion_is_payment_required() {
        let state = app_state();
        for i in 0..5 {
            let ok = create(&state, "org-1", &format!("a{i}")).await;
            assert_eq!(ok.status(), StatusCode::CREATED);
        }
        let rejected = create(&state, "org-1", "sixth").await;
        assert_eq!(rejected.status(), StatusCode::PAYMENT_REQUIRED);
        let body = body_json(rejected).await;
        assert_eq!(body["code"], "QUOTA_EXCEEDED");
        assert_eq!(body["details"]["limit"], 5);
    }

    #[tokio::test]
    async fn export_budget_rejection_carries_headers() {
        let state = app_state();
        let list = |state: AppState| {
            list_handler(
                State(state),
                auditor("org-free"),
                Path("report".into()),
                Query(ListParams {
                    export: true,
                    ..ListParams::default()
                }),
                HeaderMap::new(),
            )
        };
        assert!(list(state.clone()).await.is_ok());
        assert!(list(state.clone()).await.is_ok());

        let response = list(state).await.unwrap_err().into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RATE_LIMIT_LIMIT], "2");
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING], "0");
        assert!(response.headers().contains_key(http::header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn malformed_filter_is_bad_request() {
        let state = app_state();
        let err = count_handler(
            State(state),
            auditor("org-1"),
            Path("audit".into()),
            Query(CountParams {
                filter: Some("{not json".into()),
            }),
            HeaderMap::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn usage_reports_current_period() {
        let state = app_state();
        create(&state, "org-1", "one").await;

        let response = usage_handler(
            State(state.clone()),
            auditor("org-1"),
            Path("audit".into()),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["used"], 1);
        assert_eq!(body["limit"], 5);

        let unknown = usage_handler(
            State(state),
            auditor("org-1"),
            Path("spaceship".into()),
            HeaderMap::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(unknown.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_by_filter_stays_in_tenant() {
        let state = app_state();
        create(&state, "org-1", "keep").await;
        create(&state, "org-2", "keep").await;

        let response = delete_handler(
            State(state.clone()),
            auditor("org-2"),
            Path("audit".into()),
            HeaderMap::new(),
            Json(DeleteBody {
                filter: Filter::eq("title", "keep"),
            }),
        )
        .await
        .unwrap();
        assert_eq!(body_json(response).await["affected"], 1);

        let remaining = count_handler(
            State(state),
            auditor("org-1"),
            Path("audit".into()),
            Query(CountParams::default()),
            HeaderMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(body_json(remaining).await["count"], 1);
    }
}
