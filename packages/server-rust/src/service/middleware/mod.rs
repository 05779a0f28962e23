//! Tower middleware layers for the operation pipeline.
//!
//! - [`timeout`]: Per-operation timeout enforcement
//! - [`metrics`]: Operation timing and counting
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`tenant_context`]: Task-local request context binding
//! - [`rate_limit`]: Per-tenant admission control
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod tenant_context;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::build_operation_pipeline;
pub use rate_limit::RateLimitLayer;
pub use tenant_context::TenantContextLayer;
pub use timeout::TimeoutLayer;
