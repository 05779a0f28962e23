//! HTTP middleware.
//!
//! Two groups:
//! - transport layers from `tower-http`, applied to every route
//! - request admission and tenant binding, applied to the `/api` routes

use axum::extract::{Request, State};
use axum::http::header::{HeaderName, AUTHORIZATION, RETRY_AFTER};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hse_core::RequestContext;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use super::config::NetworkConfig;
use super::handlers::AppState;
use crate::context::with_request_context;

const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// The composed transport layers, outermost first.
type HttpLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        TimeoutLayer,
        tower::layer::util::Stack<
            CorsLayer,
            tower::layer::util::Stack<
                CompressionLayer,
                tower::layer::util::Stack<
                    TraceLayer<
                        tower_http::classify::SharedClassifier<
                            tower_http::classify::ServerErrorsAsFailures,
                        >,
                    >,
                    tower::layer::util::Stack<
                        SetRequestIdLayer<MakeRequestUuid>,
                        tower::layer::util::Identity,
                    >,
                >,
            >,
        >,
    >,
>;

/// Transport layers, outermost to innermost:
/// 1. `SetRequestId`: UUID v4 `X-Request-Id`, reused as the operation's request id
/// 2. `Trace`
/// 3. `Compression` (gzip)
/// 4. `CORS`, exposing the rate-limit headers to browser clients
/// 5. `Timeout`
/// 6. `PropagateRequestId`: copies `X-Request-Id` onto the response
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(build_cors_layer(&config.cors_origins))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
        .into_inner()
}

/// `"*"` allows any origin; otherwise only the listed ones parse into the
/// allowlist.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| o.parse().ok()))
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderName::from_static("x-ratelimit-reset"),
            RETRY_AFTER,
            X_REQUEST_ID,
        ])
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Refuses new API requests unless the server is ready, and counts the
/// admitted ones as in flight so draining waits for them.
pub async fn admission(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.shutdown.health_state().accepts_traffic() {
        return (StatusCode::SERVICE_UNAVAILABLE, [(RETRY_AFTER, "5")]).into_response();
    }
    let _in_flight = state.shutdown.in_flight_guard();
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Tenant binding
// ---------------------------------------------------------------------------

/// Authenticates the bearer token and binds the caller's tenant for the rest
/// of the request.
///
/// The verified principal is stored in the request extensions for the
/// [`Authenticated`](crate::auth::Authenticated) extractor. Requests without
/// a valid token are rejected here, so no handler ever runs unbound.
pub async fn bind_tenant(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let principal = match state.verifier.verify_header(header) {
        Ok(principal) => principal,
        Err(e) => {
            debug!(error = %e, path = %request.uri().path(), "rejecting unauthenticated request");
            return e.into_response();
        }
    };
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_string);

    request.extensions_mut().insert(principal.clone());
    let ctx = RequestContext::for_principal(request_id, principal);
    with_request_context(ctx, next.run(request)).await
}
