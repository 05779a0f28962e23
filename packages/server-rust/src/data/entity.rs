//! Which entity types are tenant-scoped.

use std::collections::HashSet;

/// Attribute that carries the owning tenant on every tenant-scoped row.
pub const TENANT_ATTRIBUTE: &str = "organization_id";

/// Primary key attribute.
pub const ID_ATTRIBUTE: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityScope {
    /// Shared by every tenant (the organization record itself, plan tables).
    Global,
    TenantScoped,
}

/// Allowlist of global and tenant-scoped entity types.
///
/// An entity on neither list is treated as tenant-scoped.
#[derive(Debug, Clone)]
pub struct EntityRegistry {
    global: HashSet<String>,
    tenant_scoped: HashSet<String>,
}

impl EntityRegistry {
    /// An empty registry: every entity is tenant-scoped.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            global: HashSet::new(),
            tenant_scoped: HashSet::new(),
        }
    }

    #[must_use]
    pub fn with_global(mut self, entity: &str) -> Self {
        self.tenant_scoped.remove(entity);
        self.global.insert(entity.to_string());
        self
    }

    #[must_use]
    pub fn with_tenant_scoped(mut self, entity: &str) -> Self {
        self.global.remove(entity);
        self.tenant_scoped.insert(entity.to_string());
        self
    }

    #[must_use]
    pub fn scope_of(&self, entity: &str) -> EntityScope {
        if self.global.contains(entity) {
            EntityScope::Global
        } else {
            EntityScope::TenantScoped
        }
    }

    #[must_use]
    pub fn is_tenant_scoped(&self, entity: &str) -> bool {
        self.scope_of(entity) == EntityScope::TenantScoped
    }

    /// Whether `entity` is explicitly listed either way.
    #[must_use]
    pub fn is_known(&self, entity: &str) -> bool {
        self.global.contains(entity) || self.tenant_scoped.contains(entity)
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        [
            "user",
            "station",
            "audit",
            "incident",
            "contractor",
            "work_permit",
            "form",
            "notification",
            "report",
        ]
        .into_iter()
        .fold(
            Self::empty()
                .with_global("organization")
                .with_global("subscription_plan"),
            Self::with_tenant_scoped,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalogue() {
        let r = EntityRegistry::default();
        assert_eq!(r.scope_of("organization"), EntityScope::Global);
        assert_eq!(r.scope_of("audit"), EntityScope::TenantScoped);
        assert!(r.is_known("work_permit"));
    }

    #[test]
    fn unknown_entities_are_tenant_scoped() {
        let r = EntityRegistry::default();
        assert!(!r.is_known("brand_new_feature"));
        assert!(r.is_tenant_scoped("brand_new_feature"));
    }

    #[test]
    fn later_registration_wins() {
        let r = EntityRegistry::empty()
            .with_global("lookup")
            .with_tenant_scoped("lookup");
        assert!(r.is_tenant_scoped("lookup"));
    }
}
