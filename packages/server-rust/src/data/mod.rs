//! Tenant-scoped data access.
//!
//! - [`entity`]: which entity types are tenant-scoped
//! - [`backend`]: the persistence seam and query types
//! - [`memory`]: in-memory backend
//! - [`interceptor`]: the tenant-scoping chokepoint
//! - [`repository`]: pre-scoped handles handed to business logic

pub mod backend;
pub mod entity;
pub mod interceptor;
pub mod memory;
pub mod repository;

pub use backend::{DataBackend, FindQuery, Include, Page};
pub use entity::{EntityRegistry, EntityScope, ID_ATTRIBUTE, TENANT_ATTRIBUTE};
pub use interceptor::{IsolationPolicy, TenantInterceptor};
pub use memory::MemoryBackend;
pub use repository::{ScopedRepository, TenantDataClient};
