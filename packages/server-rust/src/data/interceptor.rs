//! The single tenant-scoping chokepoint in front of a [`DataBackend`].
//!
//! Every read, write, update, delete and count against a tenant-scoped entity
//! is rewritten here:
//!
//! - creates get the bound tenant injected into the tenant attribute (per
//!   item for bulk creates) and fail with `MissingTenantContext` when no
//!   tenant is bound
//! - filters are ANDed with `organization_id == <bound tenant>`; a filter that
//!   names another tenant is rejected as `CrossTenantAccess`
//! - with no tenant bound, reads match zero rows (`FailClosed`) or error
//!   (`FailLoud`), and writes always error
//! - relational includes into tenant-scoped entities get the same predicate
//!
//! A system-override context skips the rewrite for filters and honours an
//! explicit tenant attribute on creates; its reason is logged on every use.

use std::sync::Arc;

use hse_core::{Document, Filter, RequestContext, TenantId, Value};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::backend::{DataBackend, FindQuery, Page};
use super::entity::{EntityRegistry, ID_ATTRIBUTE, TENANT_ATTRIBUTE};
use crate::error::TenancyError;

/// Reaction to a read/count with no tenant bound and no override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationPolicy {
    /// Inject a predicate that matches nothing.
    #[default]
    FailClosed,
    /// Return `MissingTenantContext`. For development and test deployments.
    FailLoud,
}

/// Operation names used in errors, logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Create,
    CreateMany,
    Find,
    FindOne,
    Update,
    UpdateMany,
    Delete,
    DeleteMany,
    Count,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::CreateMany => "create_many",
            Op::Find => "find",
            Op::FindOne => "find_one",
            Op::Update => "update",
            Op::UpdateMany => "update_many",
            Op::Delete => "delete",
            Op::DeleteMany => "delete_many",
            Op::Count => "count",
        }
    }

    fn is_read(self) -> bool {
        matches!(self, Op::Find | Op::FindOne | Op::Count)
    }
}

pub struct TenantInterceptor {
    backend: Arc<dyn DataBackend>,
    registry: Arc<EntityRegistry>,
    policy: IsolationPolicy,
}

impl TenantInterceptor {
    #[must_use]
    pub fn new(
        backend: Arc<dyn DataBackend>,
        registry: Arc<EntityRegistry>,
        policy: IsolationPolicy,
    ) -> Self {
        Self {
            backend,
            registry,
            policy,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    fn violation(ctx: &RequestContext, entity: &str, op: Op, err: TenancyError) -> TenancyError {
        metrics::counter!(
            "hse_isolation_violations_total",
            "entity" => entity.to_string(),
            "operation" => op.as_str(),
        )
        .increment(1);
        error!(
            request_id = %ctx.request_id,
            tenant_id = ctx.tenant().map(TenantId::as_str),
            principal_id = ctx.principal().map(|p| p.principal_id.as_str()),
            entity,
            operation = op.as_str(),
            error = %err,
            "tenant isolation violation"
        );
        err
    }

    fn missing(ctx: &RequestContext, entity: &str, op: Op) -> TenancyError {
        Self::violation(
            ctx,
            entity,
            op,
            TenancyError::MissingTenantContext {
                entity: entity.to_string(),
                operation: op.as_str(),
            },
        )
    }

    fn cross(ctx: &RequestContext, entity: &str, op: Op, bound: &TenantId, requested: &Value) -> TenancyError {
        let requested = requested
            .as_str()
            .map_or_else(|| format!("{requested:?}"), str::to_string);
        Self::violation(
            ctx,
            entity,
            op,
            TenancyError::CrossTenantAccess {
                entity: entity.to_string(),
                bound: bound.to_string(),
                requested,
            },
        )
    }

    fn log_override(ctx: &RequestContext, entity: &str, op: Op) {
        info!(
            request_id = %ctx.request_id,
            entity,
            operation = op.as_str(),
            reason = ctx.override_reason().unwrap_or_default(),
            "system override: tenant scoping bypassed"
        );
    }

    /// Rewrites `filter` for `entity` under `ctx`.
    pub(crate) fn scope_filter(
        &self,
        ctx: &RequestContext,
        entity: &str,
        op: Op,
        filter: Filter,
    ) -> Result<Filter, TenancyError> {
        if !self.registry.is_tenant_scoped(entity) {
            return Ok(filter);
        }
        if ctx.is_system_override() {
            Self::log_override(ctx, entity, op);
            return Ok(filter);
        }
        let Some(tenant) = ctx.tenant() else {
            let err = Self::missing(ctx, entity, op);
            return match (self.policy, op.is_read()) {
                (IsolationPolicy::FailClosed, true) => Ok(Filter::None),
                _ => Err(err),
            };
        };
        let bound = Value::from(tenant.as_str());
        if let Some(foreign) = filter
            .positive_values(TENANT_ATTRIBUTE)
            .into_iter()
            .find(|v| **v != bound)
        {
            return Err(Self::cross(ctx, entity, op, tenant, foreign));
        }
        Ok(filter.and(Filter::Eq {
            attribute: TENANT_ATTRIBUTE.to_string(),
            value: bound,
        }))
    }

    fn scope_query(
        &self,
        ctx: &RequestContext,
        entity: &str,
        op: Op,
        mut query: FindQuery,
    ) -> Result<FindQuery, TenancyError> {
        query.filter = self.scope_filter(ctx, entity, op, query.filter)?;
        for include in &mut query.include {
            let joined = std::mem::take(&mut include.filter);
            include.filter = self.scope_filter(ctx, &include.entity, op, joined)?;
        }
        Ok(query)
    }

    /// Validates or injects the tenant attribute on one new row.
    fn scope_new_row(
        &self,
        ctx: &RequestContext,
        entity: &str,
        op: Op,
        mut doc: Document,
    ) -> Result<Document, TenancyError> {
        if !self.registry.is_tenant_scoped(entity) {
            return Ok(doc);
        }
        let explicit = doc.get(TENANT_ATTRIBUTE).cloned();
        if ctx.is_system_override() {
            Self::log_override(ctx, entity, op);
            if explicit.as_ref().and_then(Value::as_str).is_some() {
                return Ok(doc);
            }
        }
        let Some(tenant) = ctx.tenant() else {
            return Err(Self::missing(ctx, entity, op));
        };
        let bound = Value::from(tenant.as_str());
        match explicit {
            None | Some(Value::Null) => {
                doc.insert(TENANT_ATTRIBUTE.to_string(), bound);
                Ok(doc)
            }
            Some(v) if v == bound => Ok(doc),
            Some(v) => Err(Self::cross(ctx, entity, op, tenant, &v)),
        }
    }

    /// Rejects patches that would move rows to another tenant.
    fn check_patch(
        &self,
        ctx: &RequestContext,
        entity: &str,
        op: Op,
        patch: &Document,
    ) -> Result<(), TenancyError> {
        if !self.registry.is_tenant_scoped(entity) || ctx.is_system_override() {
            return Ok(());
        }
        let Some(requested) = patch.get(TENANT_ATTRIBUTE) else {
            return Ok(());
        };
        match ctx.tenant() {
            Some(t) if requested.as_str() == Some(t.as_str()) => Ok(()),
            Some(t) => Err(Self::cross(ctx, entity, op, t, requested)),
            None => Err(Self::missing(ctx, entity, op)),
        }
    }

    pub(crate) async fn create(
        &self,
        ctx: &RequestContext,
        entity: &str,
        doc: Document,
    ) -> Result<Document, TenancyError> {
        let doc = self.scope_new_row(ctx, entity, Op::Create, doc)?;
        Ok(self.backend.insert(entity, doc).await?)
    }

    /// Every item is scoped before any is written, so one bad item rejects
    /// the whole batch.
    pub(crate) async fn create_many(
        &self,
        ctx: &RequestContext,
        entity: &str,
        docs: Vec<Document>,
    ) -> Result<Vec<Document>, TenancyError> {
        let scoped = docs
            .into_iter()
            .map(|d| self.scope_new_row(ctx, entity, Op::CreateMany, d))
            .collect::<Result<Vec<_>, _>>()?;
        let mut stored = Vec::with_capacity(scoped.len());
        for doc in scoped {
            stored.push(self.backend.insert(entity, doc).await?);
        }
        Ok(stored)
    }

    pub(crate) async fn find(
        &self,
        ctx: &RequestContext,
        entity: &str,
        query: FindQuery,
    ) -> Result<Page, TenancyError> {
        let query = self.scope_query(ctx, entity, Op::Find, query)?;
        Ok(self.backend.find(entity, &query).await?)
    }

    pub(crate) async fn find_one(
        &self,
        ctx: &RequestContext,
        entity: &str,
        filter: Filter,
    ) -> Result<Option<Document>, TenancyError> {
        let query = self.scope_query(ctx, entity, Op::FindOne, FindQuery::filter(filter).limit(1))?;
        Ok(self.backend.find(entity, &query).await?.items.into_iter().next())
    }

    pub(crate) async fn update(
        &self,
        ctx: &RequestContext,
        entity: &str,
        id: &str,
        patch: Document,
    ) -> Result<Option<Document>, TenancyError> {
        self.check_patch(ctx, entity, Op::Update, &patch)?;
        let filter = self.scope_filter(ctx, entity, Op::Update, Filter::eq(ID_ATTRIBUTE, id))?;
        Ok(self.backend.update(entity, &filter, &patch).await?.into_iter().next())
    }

    pub(crate) async fn update_many(
        &self,
        ctx: &RequestContext,
        entity: &str,
        filter: Filter,
        patch: Document,
    ) -> Result<Vec<Document>, TenancyError> {
        self.check_patch(ctx, entity, Op::UpdateMany, &patch)?;
        let filter = self.scope_filter(ctx, entity, Op::UpdateMany, filter)?;
        Ok(self.backend.update(entity, &filter, &patch).await?)
    }

    pub(crate) async fn delete(
        &self,
        ctx: &RequestContext,
        entity: &str,
        id: &str,
    ) -> Result<Option<Document>, TenancyError> {
        let filter = self.scope_filter(ctx, entity, Op::Delete, Filter::eq(ID_ATTRIBUTE, id))?;
        Ok(self.backend.delete(entity, &filter).await?.into_iter().next())
    }

    pub(crate) async fn delete_many(
        &self,
        ctx: &RequestContext,
        entity: &str,
        filter: Filter,
    ) -> Result<Vec<Document>, TenancyError> {
        let filter = self.scope_filter(ctx, entity, Op::DeleteMany, filter)?;
        Ok(self.backend.delete(entity, &filter).await?)
    }

    pub(crate) async fn count(
        &self,
        ctx: &RequestContext,
        entity: &str,
        filter: Filter,
    ) -> Result<u64, TenancyError> {
        let filter = self.scope_filter(ctx, entity, Op::Count, filter)?;
        Ok(self.backend.count(entity, &filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use hse_core::{Principal, Role};

    use super::*;
    use crate::data::backend::Include;
    use crate::data::memory::MemoryBackend;

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    fn ctx(id: &str) -> RequestContext {
        RequestContext::for_principal("req", Principal::new("u", tenant(id), Role::User))
    }

    fn interceptor(policy: IsolationPolicy) -> TenantInterceptor {
        TenantInterceptor::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(EntityRegistry::default()),
            policy,
        )
    }

    #[test]
    fn bound_tenant_is_anded_into_filter() {
        let i = interceptor(IsolationPolicy::FailClosed);
        let scoped = i
            .scope_filter(&ctx("org-1"), "audit", Op::Find, Filter::eq("status", "open"))
            .unwrap();
        assert_eq!(
            scoped,
            Filter::And {
                children: vec![
                    Filter::eq("status", "open"),
                    Filter::eq(TENANT_ATTRIBUTE, "org-1"),
                ]
            }
        );
    }

    #[test]
    fn global_entities_are_untouched() {
        let i = interceptor(IsolationPolicy::FailClosed);
        let anon = RequestContext::anonymous("req");
        let scoped = i
            .scope_filter(&anon, "organization", Op::Find, Filter::All)
            .unwrap();
        assert_eq!(scoped, Filter::All);
    }

    #[test]
    fn no_tenant_read_matches_nothing_when_fail_closed() {
        let i = interceptor(IsolationPolicy::FailClosed);
        let anon = RequestContext::anonymous("req");
        let scoped = i.scope_filter(&anon, "audit", Op::Find, Filter::All).unwrap();
        assert_eq!(scoped, Filter::None);
    }

    #[test]
    fn no_tenant_read_errors_when_fail_loud() {
        let i = interceptor(IsolationPolicy::FailLoud);
        let anon = RequestContext::anonymous("req");
        let err = i.scope_filter(&anon, "audit", Op::Count, Filter::All).unwrap_err();
        assert!(matches!(err, TenancyError::MissingTenantContext { operation: "count", .. }));
    }

    #[test]
    fn no_tenant_write_always_errors() {
        let i = interceptor(IsolationPolicy::FailClosed);
        let anon = RequestContext::anonymous("req");
        let err = i
            .scope_filter(&anon, "audit", Op::DeleteMany, Filter::All)
            .unwrap_err();
        assert!(err.is_isolation_violation());
    }

    #[test]
    fn foreign_tenant_in_filter_is_rejected() {
        let i = interceptor(IsolationPolicy::FailClosed);
        let sneaky = Filter::Or {
            children: vec![
                Filter::eq(TENANT_ATTRIBUTE, "org-1"),
                Filter::eq(TENANT_ATTRIBUTE, "org-2"),
            ],
        };
        let err = i.scope_filter(&ctx("org-1"), "incident", Op::Find, sneaky).unwrap_err();
        assert!(matches!(
            err,
            TenancyError::CrossTenantAccess { ref requested, .. } if requested == "org-2"
        ));
    }

    #[test]
    fn unknown_entity_is_scoped() {
        let i = interceptor(IsolationPolicy::FailClosed);
        let scoped = i
            .scope_filter(&ctx("org-1"), "brand_new_thing", Op::Find, Filter::All)
            .unwrap();
        assert_eq!(scoped, Filter::eq(TENANT_ATTRIBUTE, "org-1"));
    }

    #[test]
    fn override_leaves_filter_untouched() {
        let i = interceptor(IsolationPolicy::FailClosed);
        let sys = RequestContext::system("req", "support ticket 4411");
        let f = Filter::eq(TENANT_ATTRIBUTE, "org-7");
        assert_eq!(i.scope_filter(&sys, "audit", Op::Find, f.clone()).unwrap(), f);
    }

    #[test]
    fn includes_are_scoped_too() {
        let i = interceptor(IsolationPolicy::FailClosed);
        let query = FindQuery::default().include(Include {
            entity: "audit".into(),
            local_field: "id".into(),
            foreign_field: "station_id".into(),
            filter: Filter::All,
        });
        let scoped = i.scope_query(&ctx("org-1"), "station", Op::Find, query).unwrap();
        assert_eq!(scoped.include[0].filter, Filter::eq(TENANT_ATTRIBUTE, "org-1"));
    }

    #[test]
    fn create_injects_tenant() {
        let i = interceptor(IsolationPolicy::FailClosed);
        let row = i
            .scope_new_row(&ctx("org-1"), "audit", Op::Create, Document::new())
            .unwrap();
        assert_eq!(row.get(TENANT_ATTRIBUTE), Some(&Value::from("org-1")));
    }

    #[test]
    fn create_with_foreign_tenant_is_rejected() {
        let i = interceptor(IsolationPolicy::FailClosed);
        let mut doc = Document::new();
        doc.insert(TENANT_ATTRIBUTE.into(), "org-2".into());
        let err = i.scope_new_row(&ctx("org-1"), "audit", Op::Create, doc).unwrap_err();
        assert!(matches!(err, TenancyError::CrossTenantAccess { .. }));
    }

    #[test]
    fn override_create_requires_some_tenant() {
        let i = interceptor(IsolationPolicy::FailClosed);
        let sys = RequestContext::system("req", "migration");
        let err = i
            .scope_new_row(&sys, "audit", Op::Create, Document::new())
            .unwrap_err();
        assert!(matches!(err, TenancyError::MissingTenantContext { .. }));

        let mut doc = Document::new();
        doc.insert(TENANT_ATTRIBUTE.into(), "org-9".into());
        let row = i.scope_new_row(&sys, "audit", Op::Create, doc).unwrap();
        assert_eq!(row.get(TENANT_ATTRIBUTE), Some(&Value::from("org-9")));
    }

    #[test]
    fn patch_cannot_move_rows() {
        let i = interceptor(IsolationPolicy::FailClosed);
        let mut patch = Document::new();
        patch.insert(TENANT_ATTRIBUTE.into(), "org-2".into());
        assert!(i.check_patch(&ctx("org-1"), "audit", Op::Update, &patch).is_err());

        patch.insert(TENANT_ATTRIBUTE.into(), "org-1".into());
        assert!(i.check_patch(&ctx("org-1"), "audit", Op::Update, &patch).is_ok());
    }

    #[tokio::test]
    async fn create_many_is_all_or_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let i = TenantInterceptor::new(
            backend.clone(),
            Arc::new(EntityRegistry::default()),
            IsolationPolicy::FailClosed,
        );
        let mut bad = Document::new();
        bad.insert(TENANT_ATTRIBUTE.into(), "org-2".into());
        let batch = vec![Document::new(), bad, Document::new()];

        assert!(i.create_many(&ctx("org-1"), "incident", batch).await.is_err());
        assert!(backend.raw_rows("incident").is_empty());

        let ok = i
            .create_many(&ctx("org-1"), "incident", vec![Document::new(), Document::new()])
            .await
            .unwrap();
        assert!(ok
            .iter()
            .all(|d| d.get(TENANT_ATTRIBUTE) == Some(&Value::from("org-1"))));
    }
}
