//! Quota ledger records, billing periods, and usage reports.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::{Allowance, ResourceType};
use crate::tenant::TenantId;
use crate::types::Document;

/// One immutable consumption event. Running totals are derived by summing
/// entries; entries are never updated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLedgerEntry {
    pub tenant_id: TenantId,
    pub resource: ResourceType,
    pub quantity: u64,
    pub recorded_at: DateTime<Utc>,
    /// Deduplicates retried or replayed creation events per tenant.
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub metadata: Document,
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    /// Calendar month (UTC) containing `at`.
    #[must_use]
    pub fn month_containing(at: DateTime<Utc>) -> Self {
        let start = month_start(at.year(), at.month());
        let (ny, nm) = if at.month() == 12 {
            (at.year() + 1, 1)
        } else {
            (at.year(), at.month() + 1)
        };
        Self {
            start,
            end: month_start(ny, nm),
        }
    }

    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

fn month_start(year: i32, month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Usage of one resource against the plan allowance for one period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub resource: ResourceType,
    /// `-1` on the wire when unmetered.
    pub limit: Allowance,
    pub used: u64,
    /// `None` (serialized as `null`) when unmetered.
    pub remaining: Option<u64>,
    pub period: BillingPeriod,
}

impl UsageReport {
    #[must_use]
    pub fn new(resource: ResourceType, limit: Allowance, used: u64, period: BillingPeriod) -> Self {
        Self {
            resource,
            limit,
            used,
            remaining: limit.remaining(used),
            period,
        }
    }

    /// Whether one more unit may be consumed.
    #[must_use]
    pub fn has_headroom(&self) -> bool {
        self.has_headroom_for(1)
    }

    /// Whether `quantity` more units may be consumed.
    #[must_use]
    pub fn has_headroom_for(&self, quantity: u64) -> bool {
        self.remaining.is_none_or(|r| r >= quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_period_bounds() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 13, 5, 0).unwrap();
        let p = BillingPeriod::month_containing(at);
        assert_eq!(p.start, Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap());
        assert_eq!(p.end, Utc.with_ymd_and_hms(2026, 11, 1, 0, 0, 0).unwrap());
        assert!(p.contains(at));
        assert!(!p.contains(p.end));
    }

    #[test]
    fn december_rolls_year() {
        let at = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
        let p = BillingPeriod::month_containing(at);
        assert_eq!(p.end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn headroom() {
        let p = BillingPeriod::month_containing(Utc::now());
        assert!(!UsageReport::new(ResourceType::Audit, Allowance::Limited(5), 5, p).has_headroom());
        assert!(UsageReport::new(ResourceType::Audit, Allowance::Limited(5), 4, p).has_headroom());
        assert!(UsageReport::new(ResourceType::Audit, Allowance::Unlimited, 9_999, p).has_headroom());

        let three_left = UsageReport::new(ResourceType::Station, Allowance::Limited(5), 2, p);
        assert!(three_left.has_headroom_for(3));
        assert!(!three_left.has_headroom_for(4));
    }

    #[test]
    fn report_wire_shape() {
        let p = BillingPeriod::month_containing(Utc::now());
        let json = serde_json::to_value(UsageReport::new(
            ResourceType::Audit,
            Allowance::Unlimited,
            3,
            p,
        ))
        .unwrap();
        assert_eq!(json["limit"], -1);
        assert_eq!(json["used"], 3);
        assert!(json["remaining"].is_null());
    }
}
