//! HTTP and realtime transport: configuration, middleware, handlers and the
//! server lifecycle.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::*;
pub use handlers::{AppState, Services};
pub use module::NetworkModule;
pub use shutdown::*;
