//! HSE Digital core: tenant identity, request context, row filters, plan
//! limits, usage accounting types, and realtime frames.
//!
//! Pure types only. Everything that performs I/O or holds shared state lives
//! in `hse-server`.

pub mod context;
pub mod filter;
pub mod messages;
pub mod plan;
pub mod tenant;
pub mod types;
pub mod usage;

pub use context::RequestContext;
pub use filter::Filter;
pub use messages::{ClientFrame, Room, ServerFrame};
pub use plan::{Allowance, LimitClass, ResourceType, SubscriptionPlan};
pub use tenant::{Principal, Role, TenantId, TenantIdError};
pub use types::{Document, Value};
pub use usage::{BillingPeriod, QuotaLedgerEntry, UsageReport};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
