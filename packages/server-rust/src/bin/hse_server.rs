//! `hse-server`: wires the tenancy core behind the HTTP/WebSocket surface.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hse_server::auth::JwtVerifier;
use hse_server::cache::CacheManager;
use hse_server::config::ServerConfig;
use hse_server::data::{EntityRegistry, MemoryBackend, TenantDataClient, TenantInterceptor};
use hse_server::network::{NetworkModule, Services};
use hse_server::plans::{CachedPlanResolver, PlanResolver, StaticPlanResolver};
use hse_server::quota::{MemoryLedger, QuotaLedger, QuotaTracker};
use hse_server::ratelimit::RateLimiter;
use hse_server::realtime::{ConnectionRegistry, RoomRouter};
use hse_server::service::{build_operation_pipeline, RecordService};
use hse_server::store::{MemoryStore, SharedStore};
use hse_server::telemetry;
use tracing::{info, warn};

/// How often the process-local store drops expired rate-limit and cache keys.
const STORE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// The shared store, plus the concrete in-memory store when one is used so
/// its expiry sweep can be started.
struct StoreChoice {
    shared: Arc<dyn SharedStore>,
    local: Option<Arc<MemoryStore>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    telemetry::init_tracing(config.log_format)?;
    if let Some(addr) = config.metrics_addr {
        telemetry::init_metrics(addr)?;
    }

    let StoreChoice { shared: store, local } = shared_store(&config).await?;
    let ledger = quota_ledger(&config).await?;

    let static_plans = StaticPlanResolver::new();
    for assignment in &config.plans {
        static_plans.set_plan(assignment.tenant.clone(), assignment.plan);
    }
    let plans: Arc<dyn PlanResolver> = Arc::new(CachedPlanResolver::new(
        Arc::new(static_plans),
        config.plan_cache_capacity,
        config.plan_cache_ttl(),
    ));

    let network = config.network();
    let rooms = Arc::new(RoomRouter::new(
        Arc::new(ConnectionRegistry::new()),
        network.connection.max_denied_subscriptions,
    ));
    let interceptor = TenantInterceptor::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(EntityRegistry::default()),
        config.isolation_policy,
    );
    let records = RecordService::new(
        TenantDataClient::new(Arc::new(interceptor)),
        QuotaTracker::new(ledger, Arc::clone(&plans)),
        Arc::new(CacheManager::new(Arc::clone(&store), config.cache())),
        Arc::clone(&rooms),
    );
    let limiter = Arc::new(RateLimiter::new(
        Arc::clone(&store),
        plans,
        config.rate_limit(),
    ));
    let service_config = config.service();
    let services = Services {
        operations: build_operation_pipeline(records, limiter, &service_config),
        rooms,
        verifier: Arc::new(JwtVerifier::new(config.jwt_secret.as_bytes())),
        store,
        operation_timeout_ms: service_config.default_operation_timeout_ms,
    };

    let mut server = NetworkModule::new(network, services);
    if let Some(local) = &local {
        MemoryStore::spawn_sweeper(
            local,
            STORE_SWEEP_INTERVAL,
            server.shutdown_controller().shutdown_receiver(),
        );
    }
    let port = server.start().await?;
    info!(
        port,
        isolation_policy = ?config.isolation_policy,
        store_failure_policy = ?config.store_failure_policy,
        "hse-server started"
    );
    server.serve(shutdown_signal()).await?;
    info!("hse-server stopped");
    Ok(())
}

#[cfg_attr(not(feature = "redis"), allow(clippy::unused_async, unused_variables))]
async fn shared_store(config: &ServerConfig) -> anyhow::Result<StoreChoice> {
    #[cfg(feature = "redis")]
    if let Some(url) = &config.redis_url {
        let store = hse_server::store::RedisStore::connect(url, config.store_timeout()).await?;
        return Ok(StoreChoice {
            shared: Arc::new(store),
            local: None,
        });
    }
    warn!("no shared store configured, using a process-local store (single instance only)");
    let local = Arc::new(MemoryStore::new());
    Ok(StoreChoice {
        shared: Arc::clone(&local) as Arc<dyn SharedStore>,
        local: Some(local),
    })
}

#[cfg_attr(not(feature = "postgres"), allow(clippy::unused_async, unused_variables))]
async fn quota_ledger(config: &ServerConfig) -> anyhow::Result<Arc<dyn QuotaLedger>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &config.postgres_url {
        let ledger = hse_server::quota::PostgresLedger::connect(url, 10).await?;
        return Ok(Arc::new(ledger));
    }
    warn!("no ledger database configured, quota usage is kept in memory");
    Ok(Arc::new(MemoryLedger::new()))
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}
