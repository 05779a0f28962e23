//! Process configuration.
//!
//! Every option is a CLI flag with an `HSE_*` environment fallback. The
//! in-library config structs keep their own `Default`s; this module only
//! maps flags onto them.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use hse_core::{SubscriptionPlan, TenantId};

use crate::cache::CacheConfig;
use crate::data::IsolationPolicy;
use crate::network::NetworkConfig;
use crate::ratelimit::{RateLimitConfig, StoreFailurePolicy};
use crate::service::ServiceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// A `tenant=plan` assignment for the static plan table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanAssignment {
    pub tenant: TenantId,
    pub plan: SubscriptionPlan,
}

impl std::str::FromStr for PlanAssignment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tenant, plan) = s
            .split_once('=')
            .ok_or_else(|| format!("expected TENANT=PLAN, got {s:?}"))?;
        Ok(Self {
            tenant: TenantId::parse(tenant.trim()).map_err(|e| e.to_string())?,
            plan: plan.trim().parse().map_err(|e: hse_core::plan::UnknownVariant| e.to_string())?,
        })
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "hse-server")]
#[command(version, about = "HSE Digital tenancy server", long_about = None)]
pub struct ServerConfig {
    #[arg(long, env = "HSE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "HSE_PORT", default_value_t = 8080)]
    pub port: u16,

    /// HS256 secret used to verify bearer tokens.
    #[arg(long, env = "HSE_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Shared store for rate-limit counters and cache entries. Without it the
    /// server uses a process-local store, which is only correct for a single
    /// instance.
    #[cfg(feature = "redis")]
    #[arg(long, env = "HSE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Quota ledger database. Without it usage is kept in memory.
    #[cfg(feature = "postgres")]
    #[arg(long, env = "HSE_POSTGRES_URL", hide_env_values = true)]
    pub postgres_url: Option<String>,

    /// Timeout for a single shared-store call.
    #[arg(long, env = "HSE_STORE_TIMEOUT_MS", default_value_t = 250)]
    pub store_timeout_ms: u64,

    #[arg(long, env = "HSE_RATE_LIMIT_WINDOW_SECS", default_value_t = 60)]
    pub rate_limit_window_secs: u64,

    /// Behaviour when the shared store is unreachable.
    #[arg(long, env = "HSE_STORE_FAILURE_POLICY", value_enum, default_value_t = StoreFailurePolicy::FailClosed)]
    pub store_failure_policy: StoreFailurePolicy,

    /// Behaviour for tenant-scoped reads with no tenant bound.
    #[arg(long, env = "HSE_ISOLATION_POLICY", value_enum, default_value_t = IsolationPolicy::FailClosed)]
    pub isolation_policy: IsolationPolicy,

    #[arg(long, env = "HSE_CACHE_TTL_SECS", default_value_t = 300)]
    pub cache_ttl_secs: u64,

    /// How long a resolved subscription tier is reused before re-lookup.
    #[arg(long, env = "HSE_PLAN_CACHE_TTL_SECS", default_value_t = 60)]
    pub plan_cache_ttl_secs: u64,

    #[arg(long, env = "HSE_PLAN_CACHE_CAPACITY", default_value_t = 10_000)]
    pub plan_cache_capacity: usize,

    /// Static plan table entries, `TENANT=PLAN`. Unlisted tenants get the
    /// most restrictive tier.
    #[arg(long = "plan", env = "HSE_PLANS", value_delimiter = ',')]
    pub plans: Vec<PlanAssignment>,

    #[arg(long, env = "HSE_OPERATION_TIMEOUT_MS", default_value_t = 30_000)]
    pub operation_timeout_ms: u64,

    #[arg(long, env = "HSE_MAX_CONCURRENT_OPERATIONS", default_value_t = 1_000)]
    pub max_concurrent_operations: u32,

    /// Concurrent operations one tenant may hold. Keeps a busy tenant from
    /// exhausting the process-wide budget.
    #[arg(long, env = "HSE_MAX_CONCURRENT_PER_TENANT", default_value_t = 250)]
    pub max_concurrent_per_tenant: u32,

    /// Prometheus scrape address. Metrics are not exported when unset.
    #[arg(long, env = "HSE_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    #[arg(long, env = "HSE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl ServerConfig {
    #[must_use]
    pub fn network(&self) -> NetworkConfig {
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            ..NetworkConfig::default()
        }
    }

    #[must_use]
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            window: Duration::from_secs(self.rate_limit_window_secs.max(1)),
            failure_policy: self.store_failure_policy,
        }
    }

    #[must_use]
    pub fn cache(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_secs(self.cache_ttl_secs),
        }
    }

    #[must_use]
    pub fn service(&self) -> ServiceConfig {
        ServiceConfig {
            default_operation_timeout_ms: self.operation_timeout_ms,
            max_concurrent_operations: self.max_concurrent_operations,
            max_concurrent_per_tenant: self.max_concurrent_per_tenant,
        }
    }

    #[must_use]
    pub fn plan_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.plan_cache_ttl_secs)
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}
