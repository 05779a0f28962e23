use crate::tenant::{Principal, TenantId};

/// Per-request context carrying identity and tenancy.
///
/// Created at request start and dropped at request end. Owned by exactly one
/// task; cross-task propagation happens by moving or cloning the value, never
/// through shared mutable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Correlation identifier for logs and response headers.
    pub request_id: String,
    tenant_id: Option<TenantId>,
    principal: Option<Principal>,
    /// Set only by trusted administrative paths that must cross tenants.
    system_override: Option<String>,
}

impl RequestContext {
    /// Context bound to the principal's own tenant.
    #[must_use]
    pub fn for_principal(request_id: impl Into<String>, principal: Principal) -> Self {
        Self {
            request_id: request_id.into(),
            tenant_id: Some(principal.tenant_id.clone()),
            principal: Some(principal),
            system_override: None,
        }
    }

    /// Context bound to a tenant with no principal (background jobs acting for
    /// one organization).
    #[must_use]
    pub fn for_tenant(request_id: impl Into<String>, tenant_id: TenantId) -> Self {
        Self {
            request_id: request_id.into(),
            tenant_id: Some(tenant_id),
            principal: None,
            system_override: None,
        }
    }

    /// Unauthenticated context. Tenant-scoped operations are denied.
    #[must_use]
    pub fn anonymous(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            tenant_id: None,
            principal: None,
            system_override: None,
        }
    }

    /// Cross-tenant system context for platform tooling. `reason` is logged
    /// with every operation executed under the override.
    #[must_use]
    pub fn system(request_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            tenant_id: None,
            principal: None,
            system_override: Some(reason.into()),
        }
    }

    /// Binds `tenant_id` to this context, replacing any previous binding.
    pub fn set_tenant(&mut self, tenant_id: TenantId) {
        self.tenant_id = Some(tenant_id);
    }

    /// The bound tenant, or `None` for system/unauthenticated contexts.
    /// Callers touching tenant-scoped data must treat `None` as deny.
    #[must_use]
    pub fn tenant(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    /// Removes the tenant binding, the principal and any system override.
    /// A cleared context is anonymous and fails closed.
    pub fn clear(&mut self) {
        self.tenant_id = None;
        self.principal = None;
        self.system_override = None;
    }

    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    #[must_use]
    pub fn is_system_override(&self) -> bool {
        self.system_override.is_some()
    }

    #[must_use]
    pub fn override_reason(&self) -> Option<&str> {
        self.system_override.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::Role;

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    #[test]
    fn for_principal_binds_principal_tenant() {
        let p = Principal::new("u-1", tenant("org-1"), Role::Auditor);
        let ctx = RequestContext::for_principal("req-1", p);
        assert_eq!(ctx.tenant(), Some(&tenant("org-1")));
        assert!(!ctx.is_system_override());
    }

    #[test]
    fn set_get_clear() {
        let mut ctx = RequestContext::anonymous("req-2");
        assert!(ctx.tenant().is_none());

        ctx.set_tenant(tenant("org-2"));
        assert_eq!(ctx.tenant(), Some(&tenant("org-2")));

        ctx.clear();
        assert!(ctx.tenant().is_none());
        assert!(ctx.principal().is_none());
    }

    #[test]
    fn system_context_has_override_and_no_tenant() {
        let ctx = RequestContext::system("req-3", "support ticket 881");
        assert!(ctx.is_system_override());
        assert_eq!(ctx.override_reason(), Some("support ticket 881"));
        assert!(ctx.tenant().is_none());
    }

    #[test]
    fn clear_drops_system_override() {
        let mut ctx = RequestContext::system("req-4", "migration");
        ctx.set_tenant(tenant("org-4"));
        ctx.clear();
        assert!(!ctx.is_system_override());
        assert!(ctx.override_reason().is_none());
        assert!(ctx.tenant().is_none());
    }
}
