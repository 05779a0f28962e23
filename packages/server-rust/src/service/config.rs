/// Configuration for the operation pipeline.
///
/// Controls operation timeouts and concurrency limits.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Default timeout for operations in milliseconds.
    pub default_operation_timeout_ms: u64,
    /// Maximum number of concurrent operations before load shedding.
    pub max_concurrent_operations: u32,
    /// Share of `max_concurrent_operations` one tenant may hold at once.
    pub max_concurrent_per_tenant: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_operation_timeout_ms: 30_000,
            max_concurrent_operations: 1000,
            max_concurrent_per_tenant: 250,
        }
    }
}
