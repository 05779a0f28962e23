//! Subscription tiers and the limit tables derived from them.
//!
//! Rate limits bound request velocity per [`LimitClass`]; allowances bound
//! cumulative volume per [`ResourceType`] and billing period. Both tables are
//! pure functions of the tier so they can be resolved without I/O once the
//! tenant's tier is known.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A tenant's subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPlan {
    Free,
    Starter,
    Professional,
    Enterprise,
}

impl SubscriptionPlan {
    /// Tier applied when a tenant's plan cannot be resolved: the most
    /// restrictive one.
    pub const FALLBACK: SubscriptionPlan = SubscriptionPlan::Free;

    /// Requests per window for `class` on this tier.
    #[must_use]
    pub fn rate_limit(self, class: LimitClass) -> u64 {
        use LimitClass::{Api, Auth, Export, Upload};
        use SubscriptionPlan::{Enterprise, Free, Professional, Starter};

        match (self, class) {
            (Free, Api) => 60,
            (Starter, Api) => 300,
            (Professional, Api) => 1_000,
            (Enterprise, Api) => 5_000,
            (Free | Starter, Auth) => 10,
            (Professional | Enterprise, Auth) => 30,
            (Free, Upload) => 5,
            (Starter, Upload) => 20,
            (Professional, Upload) => 60,
            (Enterprise, Upload) => 200,
            (Free, Export) => 2,
            (Starter, Export) => 10,
            (Professional, Export) => 30,
            (Enterprise, Export) => 100,
        }
    }

    /// Per-billing-period allowance for `resource` on this tier.
    #[must_use]
    pub fn allowance(self, resource: ResourceType) -> Allowance {
        use Allowance::Limited;
        use ResourceType::{Audit, Contractor, Incident, Station, User, WorkPermit};
        use SubscriptionPlan::{Enterprise, Free, Professional, Starter};

        match (self, resource) {
            (Enterprise, _) => Allowance::Unlimited,
            (Free, Audit) => Limited(2),
            (Free, Incident) => Limited(10),
            (Free, WorkPermit) => Limited(5),
            (Free, Station) => Limited(1),
            (Free, User) => Limited(3),
            (Free, Contractor) => Limited(5),
            (Starter, Audit) => Limited(5),
            (Starter, Incident) => Limited(50),
            (Starter, WorkPermit) => Limited(25),
            (Starter, Station) => Limited(5),
            (Starter, User) => Limited(10),
            (Starter, Contractor) => Limited(25),
            (Professional, Audit) => Limited(100),
            (Professional, Incident) => Limited(500),
            (Professional, WorkPermit) => Limited(250),
            (Professional, Station) => Limited(50),
            (Professional, User) => Limited(100),
            (Professional, Contractor) => Limited(250),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionPlan::Free => "free",
            SubscriptionPlan::Starter => "starter",
            SubscriptionPlan::Professional => "professional",
            SubscriptionPlan::Enterprise => "enterprise",
        }
    }
}

impl FromStr for SubscriptionPlan {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(SubscriptionPlan::Free),
            "starter" => Ok(SubscriptionPlan::Starter),
            "professional" | "pro" => Ok(SubscriptionPlan::Professional),
            "enterprise" => Ok(SubscriptionPlan::Enterprise),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

/// Returned when parsing an unrecognised plan, class, or resource name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

/// Endpoint class a rate-limit budget applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitClass {
    /// General API traffic.
    Api,
    /// Login, token refresh, password reset.
    Auth,
    /// Evidence photos and attachments.
    Upload,
    /// PDF/CSV report exports.
    Export,
}

impl LimitClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LimitClass::Api => "api",
            LimitClass::Auth => "auth",
            LimitClass::Upload => "upload",
            LimitClass::Export => "export",
        }
    }
}

impl fmt::Display for LimitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quota-bound resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Audit,
    Incident,
    WorkPermit,
    Station,
    User,
    Contractor,
}

impl ResourceType {
    pub const ALL: [ResourceType; 6] = [
        ResourceType::Audit,
        ResourceType::Incident,
        ResourceType::WorkPermit,
        ResourceType::Station,
        ResourceType::User,
        ResourceType::Contractor,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Audit => "audit",
            ResourceType::Incident => "incident",
            ResourceType::WorkPermit => "work_permit",
            ResourceType::Station => "station",
            ResourceType::User => "user",
            ResourceType::Contractor => "contractor",
        }
    }

    /// Quota resource backing a persisted entity type, if any.
    #[must_use]
    pub fn for_entity(entity: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == entity)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::for_entity(s).ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// Allowance for one resource per billing period.
///
/// Serialized as an integer where `-1` means unmetered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allowance {
    Limited(u64),
    Unlimited,
}

impl Allowance {
    /// Remaining units after `used`, or `None` when unmetered.
    #[must_use]
    pub fn remaining(self, used: u64) -> Option<u64> {
        match self {
            Allowance::Limited(limit) => Some(limit.saturating_sub(used)),
            Allowance::Unlimited => None,
        }
    }

    /// Wire form: the limit, or `-1` for unmetered.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Allowance::Limited(limit) => i64::try_from(limit).unwrap_or(i64::MAX),
            Allowance::Unlimited => -1,
        }
    }
}

impl Serialize for Allowance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_i64())
    }
}

impl<'de> Deserialize<'de> for Allowance {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        match raw {
            -1 => Ok(Allowance::Unlimited),
            n if n >= 0 => Ok(Allowance::Limited(n.unsigned_abs())),
            n => Err(serde::de::Error::custom(format!("invalid allowance {n}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starter_allows_five_audits() {
        assert_eq!(
            SubscriptionPlan::Starter.allowance(ResourceType::Audit),
            Allowance::Limited(5)
        );
    }

    #[test]
    fn enterprise_is_unmetered() {
        for r in ResourceType::ALL {
            assert_eq!(SubscriptionPlan::Enterprise.allowance(r), Allowance::Unlimited);
        }
    }

    #[test]
    fn fallback_is_most_restrictive() {
        let plans = [
            SubscriptionPlan::Free,
            SubscriptionPlan::Starter,
            SubscriptionPlan::Professional,
            SubscriptionPlan::Enterprise,
        ];
        for class in [LimitClass::Api, LimitClass::Auth, LimitClass::Upload, LimitClass::Export] {
            let min = plans.iter().map(|p| p.rate_limit(class)).min().unwrap();
            assert_eq!(SubscriptionPlan::FALLBACK.rate_limit(class), min);
        }
    }

    #[test]
    fn allowance_wire_form() {
        assert_eq!(serde_json::to_string(&Allowance::Unlimited).unwrap(), "-1");
        assert_eq!(serde_json::to_string(&Allowance::Limited(5)).unwrap(), "5");
        assert_eq!(
            serde_json::from_str::<Allowance>("-1").unwrap(),
            Allowance::Unlimited
        );
        assert!(serde_json::from_str::<Allowance>("-2").is_err());
    }

    #[test]
    fn remaining_saturates() {
        assert_eq!(Allowance::Limited(5).remaining(7), Some(0));
        assert_eq!(Allowance::Unlimited.remaining(7), None);
    }

    #[test]
    fn parse_names() {
        assert_eq!("Starter".parse::<SubscriptionPlan>().unwrap(), SubscriptionPlan::Starter);
        assert_eq!("work_permit".parse::<ResourceType>().unwrap(), ResourceType::WorkPermit);
        assert!("gold".parse::<SubscriptionPlan>().is_err());
    }
}
