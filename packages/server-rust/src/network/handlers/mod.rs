//! HTTP and WebSocket handlers and the state they share.

pub mod health;
pub mod records;
pub mod websocket;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use records::{
    count_handler, create_handler, delete_handler, list_handler, update_handler, usage_handler,
};
pub use websocket::ws_upgrade_handler;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::FromRef;

use super::{NetworkConfig, ShutdownController};
use crate::auth::JwtVerifier;
use crate::realtime::RoomRouter;
use crate::service::OperationPipeline;
use crate::store::SharedStore;

/// Application services the network layer dispatches into.
#[derive(Clone)]
pub struct Services {
    pub operations: OperationPipeline,
    pub rooms: Arc<RoomRouter>,
    pub verifier: Arc<JwtVerifier>,
    /// Pinged by the readiness probe.
    pub store: Arc<dyn SharedStore>,
    pub operation_timeout_ms: u64,
}

/// State carried through axum extractors. Cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub operations: OperationPipeline,
    pub rooms: Arc<RoomRouter>,
    pub verifier: Arc<JwtVerifier>,
    pub store: Arc<dyn SharedStore>,
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    pub operation_timeout_ms: u64,
    call_ids: Arc<AtomicU64>,
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(
        services: Services,
        shutdown: Arc<ShutdownController>,
        config: Arc<NetworkConfig>,
    ) -> Self {
        Self {
            operations: services.operations,
            rooms: services.rooms,
            verifier: services.verifier,
            store: services.store,
            shutdown,
            config,
            operation_timeout_ms: services.operation_timeout_ms,
            call_ids: Arc::new(AtomicU64::new(1)),
            start_time: Instant::now(),
        }
    }

    /// Monotonic id for the next pipeline call.
    pub(crate) fn next_call_id(&self) -> u64 {
        self.call_ids.fetch_add(1, Ordering::Relaxed)
    }
}

impl FromRef<AppState> for Arc<JwtVerifier> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.verifier)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use hse_core::{Principal, Role, SubscriptionPlan, TenantId};

    use super::{AppState, Services};
    use crate::auth::JwtVerifier;
    use crate::cache::{CacheConfig, CacheManager};
    use crate::data::{
        EntityRegistry, IsolationPolicy, MemoryBackend, TenantDataClient, TenantInterceptor,
    };
    use crate::network::{NetworkConfig, ShutdownController};
    use crate::plans::{PlanResolver, StaticPlanResolver};
    use crate::quota::{memory::MemoryLedger, QuotaTracker};
    use crate::ratelimit::{RateLimitConfig, RateLimiter};
    use crate::realtime::{ConnectionRegistry, RoomRouter};
    use crate::service::{build_operation_pipeline, RecordService, ServiceConfig};
    use crate::store::{MemoryStore, SharedStore};

    pub const SECRET: &[u8] = b"network-test-secret";

    pub fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    pub fn token(principal_id: &str, org: &str, role: Role) -> String {
        JwtVerifier::new(SECRET)
            .issue(
                &Principal::new(principal_id, tenant(org), role),
                chrono::Duration::minutes(5),
            )
            .unwrap()
    }

    /// Services over in-memory seams. `org-1` and `org-2` are on `Starter`,
    /// `org-free` on `Free`.
    pub fn services() -> Services {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let plans: Arc<dyn PlanResolver> = Arc::new(
            StaticPlanResolver::new()
                .with_plan(tenant("org-1"), SubscriptionPlan::Starter)
                .with_plan(tenant("org-2"), SubscriptionPlan::Starter)
                .with_plan(tenant("org-free"), SubscriptionPlan::Free),
        );
        let rooms = Arc::new(RoomRouter::new(Arc::new(ConnectionRegistry::new()), 5));
        let interceptor = TenantInterceptor::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(EntityRegistry::default()),
            IsolationPolicy::FailClosed,
        );
        let records = RecordService::new(
            TenantDataClient::new(Arc::new(interceptor)),
            QuotaTracker::new(Arc::new(MemoryLedger::new()), Arc::clone(&plans)),
            Arc::new(CacheManager::new(Arc::clone(&store), CacheConfig::default())),
            Arc::clone(&rooms),
        );
        let limiter = Arc::new(RateLimiter::new(
            Arc::clone(&store),
            plans,
            RateLimitConfig::default(),
        ));
        Services {
            operations: build_operation_pipeline(records, limiter, &ServiceConfig::default()),
            rooms,
            verifier: Arc::new(JwtVerifier::new(SECRET)),
            store,
            operation_timeout_ms: 5_000,
        }
    }

    pub fn app_state() -> AppState {
        AppState::new(
            services(),
            Arc::new(ShutdownController::new()),
            Arc::new(NetworkConfig::default()),
        )
    }
}
