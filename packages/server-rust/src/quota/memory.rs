use std::collections::HashSet;

use async_trait::async_trait;
use hse_core::{BillingPeriod, QuotaLedgerEntry, ResourceType, TenantId};
use parking_lot::Mutex;

use super::{AppendOutcome, QuotaLedger};

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<QuotaLedgerEntry>,
    keys: HashSet<(TenantId, String)>,
}

/// Process-local ledger. The idempotency check and the append happen under
/// one lock.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries across all tenants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select<'a>(
        entries: &'a [QuotaLedgerEntry],
        tenant: &'a TenantId,
        resource: ResourceType,
        period: &'a BillingPeriod,
    ) -> impl Iterator<Item = &'a QuotaLedgerEntry> {
        entries.iter().filter(move |e| {
            &e.tenant_id == tenant && e.resource == resource && period.contains(e.recorded_at)
        })
    }
}

#[async_trait]
impl QuotaLedger for MemoryLedger {
    async fn append(&self, entry: QuotaLedgerEntry) -> anyhow::Result<AppendOutcome> {
        let mut inner = self.inner.lock();
        if let Some(key) = &entry.idempotency_key {
            if !inner.keys.insert((entry.tenant_id.clone(), key.clone())) {
                return Ok(AppendOutcome::Duplicate);
            }
        }
        inner.entries.push(entry);
        Ok(AppendOutcome::Appended)
    }

    async fn sum(
        &self,
        tenant: &TenantId,
        resource: ResourceType,
        period: &BillingPeriod,
    ) -> anyhow::Result<u64> {
        let inner = self.inner.lock();
        Ok(Self::select(&inner.entries, tenant, resource, period)
            .map(|e| e.quantity)
            .sum())
    }

    async fn entries(
        &self,
        tenant: &TenantId,
        resource: ResourceType,
        period: &BillingPeriod,
    ) -> anyhow::Result<Vec<QuotaLedgerEntry>> {
        let inner = self.inner.lock();
        Ok(Self::select(&inner.entries, tenant, resource, period)
            .cloned()
            .collect())
    }

    async fn find_key(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
    ) -> anyhow::Result<Option<QuotaLedgerEntry>> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .iter()
            .find(|e| &e.tenant_id == tenant && e.idempotency_key.as_deref() == Some(idempotency_key))
            .cloned())
    }
}
