//! Tenant identity and authenticated principals.
//!
//! A [`TenantId`] is validated once at parse time so that it can be embedded
//! as a literal segment in shared-store keys (`rl:<tenant>:...`,
//! `cache:<tenant>:...`) and room names without escaping.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum accepted length of a tenant identifier.
pub const MAX_TENANT_ID_LEN: usize = 128;

/// Errors produced when parsing a [`TenantId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TenantIdError {
    #[error("tenant id must not be empty")]
    Empty,
    #[error("tenant id exceeds {MAX_TENANT_ID_LEN} characters")]
    TooLong,
    #[error("tenant id contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("tenant ids starting with '_' are reserved")]
    Reserved,
}

/// Opaque, immutable identifier of one customer organization.
///
/// Only `[A-Za-z0-9_-]` is accepted, which keeps `:` and glob metacharacters
/// out of every key that embeds a tenant. A leading `_` is reserved for
/// sentinel segments such as the global cache namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Parses and validates a tenant identifier.
    ///
    /// # Errors
    ///
    /// Returns [`TenantIdError`] when the input is empty, too long, or contains
    /// a character outside `[A-Za-z0-9_-]`.
    pub fn parse(raw: impl Into<String>) -> Result<Self, TenantIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(TenantIdError::Empty);
        }
        if raw.len() > MAX_TENANT_ID_LEN {
            return Err(TenantIdError::TooLong);
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(TenantIdError::InvalidChar(bad));
        }
        if raw.starts_with('_') {
            return Err(TenantIdError::Reserved);
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = TenantIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = TenantIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Role carried by an authenticated principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Auditor,
    User,
    /// Platform support staff. The only role allowed into the cross-tenant
    /// admin room and the only one that may request a system override.
    PlatformAdmin,
}

impl Role {
    /// Whether this role is an elevated, cross-tenant platform role.
    #[must_use]
    pub fn is_elevated(self) -> bool {
        matches!(self, Role::PlatformAdmin)
    }
}

/// An already-authenticated caller, produced by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Unique identifier of the authenticated user or API key.
    pub principal_id: String,
    /// Organization the principal belongs to.
    pub tenant_id: TenantId,
    pub role: Role,
}

impl Principal {
    #[must_use]
    pub fn new(principal_id: impl Into<String>, tenant_id: TenantId, role: Role) -> Self {
        Self {
            principal_id: principal_id.into(),
            tenant_id,
            role,
        }
    }

    #[must_use]
    pub fn is_elevated(&self) -> bool {
        self.role.is_elevated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_uuid_and_slug_forms() {
        assert!(TenantId::parse("org-1").is_ok());
        assert!(TenantId::parse("6f1c2b9e-8d1f-4b7a-9c3e-2a1b0c9d8e7f").is_ok());
        assert!(TenantId::parse("acme_corp").is_ok());
    }

    #[test]
    fn parse_rejects_empty() {
        assert_eq!(TenantId::parse(""), Err(TenantIdError::Empty));
    }

    #[test]
    fn parse_rejects_key_separators_and_globs() {
        assert_eq!(TenantId::parse("a:b"), Err(TenantIdError::InvalidChar(':')));
        assert_eq!(TenantId::parse("a*"), Err(TenantIdError::InvalidChar('*')));
        assert_eq!(TenantId::parse("a b"), Err(TenantIdError::InvalidChar(' ')));
    }

    #[test]
    fn parse_rejects_reserved_prefix() {
        assert_eq!(TenantId::parse("_global"), Err(TenantIdError::Reserved));
        assert!(TenantId::parse("org_global").is_ok());
    }

    #[test]
    fn parse_rejects_overlong() {
        let raw = "a".repeat(MAX_TENANT_ID_LEN + 1);
        assert_eq!(TenantId::parse(raw), Err(TenantIdError::TooLong));
    }

    #[test]
    fn serde_round_trip_validates() {
        let id = TenantId::parse("org-7").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"org-7\"");
        let back: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let bad: Result<TenantId, _> = serde_json::from_str("\"org:7\"");
        assert!(bad.is_err());
    }

    #[test]
    fn only_platform_admin_is_elevated() {
        assert!(Role::PlatformAdmin.is_elevated());
        for role in [Role::Admin, Role::Manager, Role::Auditor, Role::User] {
            assert!(!role.is_elevated());
        }
    }
}
