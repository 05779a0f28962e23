//! Operation execution framework.
//!
//! 1. **Operations** (`operation`): typed requests carrying the caller's context
//! 2. **Middleware** (`middleware`): Tower layers (load shedding, timeout,
//!    metrics, tenant context, rate limiting)
//! 3. **Domain services** (`domain`): tenant-scoped record handling

pub mod config;
pub mod domain;
pub mod middleware;
pub mod operation;

pub use config::ServiceConfig;
pub use domain::RecordService;
pub use middleware::pipeline::OperationPipeline;
pub use middleware::build_operation_pipeline;
pub use operation::{
    Operation, OperationContext, OperationError, OperationFuture, OperationOutput,
    OperationResponse,
};
