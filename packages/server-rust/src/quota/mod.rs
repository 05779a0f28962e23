//! Plan allowance accounting.
//!
//! Usage is an append-only ledger; totals are always derived by aggregation.
//! Creation flows go through [`QuotaTracker::check_and_record_quota`], which
//! checks headroom up front and hands back a [`QuotaReservation`]. The ledger
//! entry is appended only when the reservation is committed after the
//! resource was actually created.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hse_core::{BillingPeriod, Document, QuotaLedgerEntry, ResourceType, TenantId, UsageReport};
use tracing::{debug, info};

use crate::error::TenancyError;
use crate::plans::{resolve_or_fallback, PlanResolver};

pub use memory::MemoryLedger;
#[cfg(feature = "postgres")]
pub use postgres::PostgresLedger;

/// Result of appending to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// An entry with the same `(tenant, idempotency_key)` already exists.
    Duplicate,
}

/// Durable, append-only usage storage.
///
/// Used as `Arc<dyn QuotaLedger>`.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Appends `entry` unless its idempotency key was already recorded for
    /// the same tenant.
    async fn append(&self, entry: QuotaLedgerEntry) -> anyhow::Result<AppendOutcome>;

    /// Sum of quantities for `tenant`/`resource` recorded within `period`.
    async fn sum(
        &self,
        tenant: &TenantId,
        resource: ResourceType,
        period: &BillingPeriod,
    ) -> anyhow::Result<u64>;

    /// Entries for `tenant`/`resource` within `period`, oldest first.
    async fn entries(
        &self,
        tenant: &TenantId,
        resource: ResourceType,
        period: &BillingPeriod,
    ) -> anyhow::Result<Vec<QuotaLedgerEntry>>;

    /// The entry previously recorded under `idempotency_key` for `tenant`.
    async fn find_key(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
    ) -> anyhow::Result<Option<QuotaLedgerEntry>>;
}

/// Answers "how much has this tenant used" and guards creations.
#[derive(Clone)]
pub struct QuotaTracker {
    ledger: Arc<dyn QuotaLedger>,
    plans: Arc<dyn PlanResolver>,
}

impl QuotaTracker {
    #[must_use]
    pub fn new(ledger: Arc<dyn QuotaLedger>, plans: Arc<dyn PlanResolver>) -> Self {
        Self { ledger, plans }
    }

    /// Appends one usage entry.
    ///
    /// # Errors
    ///
    /// Returns [`TenancyError::Backend`] if the ledger write fails.
    pub async fn record_usage(
        &self,
        tenant: &TenantId,
        resource: ResourceType,
        quantity: u64,
        metadata: Document,
        idempotency_key: Option<String>,
    ) -> Result<AppendOutcome, TenancyError> {
        let entry = QuotaLedgerEntry {
            tenant_id: tenant.clone(),
            resource,
            quantity,
            recorded_at: Utc::now(),
            idempotency_key,
            metadata,
        };
        let outcome = self.ledger.append(entry).await?;
        if outcome == AppendOutcome::Duplicate {
            debug!(tenant_id = %tenant, resource = %resource, "usage replay ignored");
        }
        Ok(outcome)
    }

    /// Usage of `resource` by `tenant` within `period`.
    ///
    /// # Errors
    ///
    /// Returns [`TenancyError::Backend`] if the ledger read fails.
    pub async fn get_usage(
        &self,
        tenant: &TenantId,
        resource: ResourceType,
        period: BillingPeriod,
    ) -> Result<UsageReport, TenancyError> {
        let plan = resolve_or_fallback(self.plans.as_ref(), tenant).await;
        let used = self.ledger.sum(tenant, resource, &period).await?;
        Ok(UsageReport::new(resource, plan.allowance(resource), used, period))
    }

    /// Usage within the billing period containing `now`.
    ///
    /// # Errors
    ///
    /// See [`get_usage`](Self::get_usage).
    pub async fn usage_at(
        &self,
        tenant: &TenantId,
        resource: ResourceType,
        now: DateTime<Utc>,
    ) -> Result<UsageReport, TenancyError> {
        self.get_usage(tenant, resource, BillingPeriod::month_containing(now))
            .await
    }

    /// Current-period usage, failing with `QuotaExceeded` when nothing remains.
    ///
    /// # Errors
    ///
    /// Returns [`TenancyError::QuotaExceeded`] or [`TenancyError::Backend`].
    pub async fn check_quota(
        &self,
        tenant: &TenantId,
        resource: ResourceType,
    ) -> Result<UsageReport, TenancyError> {
        self.check_headroom(tenant, resource, 1).await
    }

    /// Current-period usage, failing with `QuotaExceeded` unless `quantity`
    /// more units fit in the allowance.
    ///
    /// # Errors
    ///
    /// Returns [`TenancyError::QuotaExceeded`] or [`TenancyError::Backend`].
    pub async fn check_headroom(
        &self,
        tenant: &TenantId,
        resource: ResourceType,
        quantity: u64,
    ) -> Result<UsageReport, TenancyError> {
        let report = self.usage_at(tenant, resource, Utc::now()).await?;
        if report.has_headroom_for(quantity) {
            return Ok(report);
        }
        metrics::counter!("hse_quota_rejections_total", "resource" => resource.as_str())
            .increment(1);
        info!(
            tenant_id = %tenant,
            resource = %resource,
            used = report.used,
            requested = quantity,
            "quota exhausted for billing period"
        );
        Err(TenancyError::QuotaExceeded {
            resource,
            limit: report.limit.remaining(0).unwrap_or(u64::MAX),
            used: report.used,
        })
    }

    /// The ledger entry a previous creation recorded under
    /// `idempotency_key`, if any. Its metadata names the created resource.
    ///
    /// # Errors
    ///
    /// Returns [`TenancyError::Backend`] if the ledger read fails.
    pub async fn replayed(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
    ) -> Result<Option<QuotaLedgerEntry>, TenancyError> {
        let found = self.ledger.find_key(tenant, idempotency_key).await?;
        if let Some(entry) = &found {
            debug!(tenant_id = %tenant, resource = %entry.resource, "idempotency key already recorded");
        }
        Ok(found)
    }

    /// Guard to call immediately before creating a quota-bound resource.
    ///
    /// Headroom is always checked, key or not. Callers that want replay
    /// semantics resolve the key with [`Self::replayed`] first; a reservation
    /// whose key was recorded concurrently commits as
    /// [`AppendOutcome::Duplicate`].
    ///
    /// # Errors
    ///
    /// Returns [`TenancyError::QuotaExceeded`] or [`TenancyError::Backend`].
    pub async fn check_and_record_quota(
        &self,
        tenant: &TenantId,
        resource: ResourceType,
        idempotency_key: Option<String>,
    ) -> Result<QuotaReservation, TenancyError> {
        self.check_quota(tenant, resource).await?;
        Ok(QuotaReservation {
            tracker: self.clone(),
            tenant: tenant.clone(),
            resource,
            idempotency_key,
        })
    }
}

/// Headroom confirmed for one creation. Commit after the creation succeeded;
/// dropping the reservation records nothing.
#[must_use = "a reservation records usage only when committed"]
pub struct QuotaReservation {
    tracker: QuotaTracker,
    tenant: TenantId,
    resource: ResourceType,
    idempotency_key: Option<String>,
}

impl QuotaReservation {
    #[must_use]
    pub fn resource(&self) -> ResourceType {
        self.resource
    }

    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Records one unit of usage.
    ///
    /// # Errors
    ///
    /// Returns [`TenancyError::Backend`] if the ledger write fails.
    pub async fn commit(self, metadata: Document) -> Result<AppendOutcome, TenancyError> {
        self.tracker
            .record_usage(
                &self.tenant,
                self.resource,
                1,
                metadata,
                self.idempotency_key,
            )
            .await
    }
}
