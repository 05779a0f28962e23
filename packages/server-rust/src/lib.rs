//! HSE Digital server: tenant isolation and quota enforcement.
//!
//! - [`context`]: task-local tenant binding
//! - [`data`]: the tenant-scoping interceptor in front of every data access
//! - [`ratelimit`], [`quota`], [`plans`]: per-tenant velocity and volume limits
//! - [`cache`]: tenant-namespaced shared cache
//! - [`realtime`]: tenant-contained broadcast rooms
//! - [`service`]: the operation pipeline tying the above together
//! - [`network`]: HTTP and WebSocket surface

pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod network;
pub mod plans;
pub mod quota;
pub mod ratelimit;
pub mod realtime;
pub mod service;
pub mod store;
pub mod telemetry;

pub use error::TenancyError;
