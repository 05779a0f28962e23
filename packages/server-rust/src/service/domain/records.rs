//! Record operations: tenant-scoped CRUD with quota, cache and realtime
//! side effects.
//!
//! Reads go through the request's scoped repository and are cached under the
//! caller's tenant namespace. Writes are followed, in order, by quota
//! accounting (creates only), cache invalidation for every tenant whose rows
//! changed, and a realtime event to those tenants' rooms.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use hse_core::{Document, Filter, QuotaLedgerEntry, RequestContext, ResourceType, TenantId, Value};
use tower::Service;
use tracing::{error, warn};

use crate::cache::{CacheKey, CacheManager, FetchOptions};
use crate::data::{FindQuery, Page, ScopedRepository, TenantDataClient, ID_ATTRIBUTE, TENANT_ATTRIBUTE};
use crate::error::TenancyError;
use crate::quota::{AppendOutcome, QuotaTracker};
use crate::realtime::RoomRouter;
use crate::service::operation::{
    Operation, OperationError, OperationFuture, OperationOutput, OperationResponse,
};

/// Innermost service of the operation pipeline.
#[derive(Clone)]
pub struct RecordService {
    data: TenantDataClient,
    quota: QuotaTracker,
    cache: Arc<CacheManager>,
    rooms: Arc<RoomRouter>,
}

impl RecordService {
    #[must_use]
    pub fn new(
        data: TenantDataClient,
        quota: QuotaTracker,
        cache: Arc<CacheManager>,
        rooms: Arc<RoomRouter>,
    ) -> Self {
        Self {
            data,
            quota,
            cache,
            rooms,
        }
    }

    /// Runs `op` against the repository bound to the task-local context.
    /// Outside a bound scope the repository is anonymous and fails closed.
    ///
    /// # Errors
    ///
    /// Any [`TenancyError`] raised by scoping, quota or persistence.
    pub async fn handle(&self, op: Operation) -> Result<OperationOutput, TenancyError> {
        let repo = self.data.current();
        match op {
            Operation::Create {
                entity,
                doc,
                idempotency_key,
                ..
            } => self
                .create(&repo, &entity, doc, idempotency_key)
                .await
                .map(OperationOutput::Created),
            Operation::CreateMany { entity, docs, .. } => self
                .create_many(&repo, &entity, docs)
                .await
                .map(OperationOutput::CreatedMany),
            Operation::Find { entity, query, .. } => {
                self.find(&repo, &entity, query).await.map(OperationOutput::Page)
            }
            Operation::Count { entity, filter, .. } => {
                self.count(&repo, &entity, filter).await.map(OperationOutput::Count)
            }
            Operation::Update {
                entity,
                filter,
                patch,
                ..
            } => {
                let rows = repo.update_many(&entity, filter, patch).await?;
                self.after_write(&entity, "updated", &rows).await;
                Ok(OperationOutput::Affected(rows))
            }
            Operation::Delete { entity, filter, .. } => {
                let rows = repo.delete_many(&entity, filter).await?;
                self.after_write(&entity, "deleted", &rows).await;
                Ok(OperationOutput::Affected(rows))
            }
            Operation::GetUsage { resource, .. } => {
                let tenant = bound_tenant(repo.context(), "quota_usage", "get_usage")?;
                let report = self.quota.usage_at(&tenant, resource, Utc::now()).await?;
                Ok(OperationOutput::Usage(report))
            }
        }
    }

    async fn create(
        &self,
        repo: &ScopedRepository,
        entity: &str,
        doc: Document,
        mut idempotency_key: Option<String>,
    ) -> Result<Document, TenancyError> {
        let metered = match (metering_tenant(repo.context(), &doc), ResourceType::for_entity(entity)) {
            (Some(tenant), Some(resource)) => Some((tenant, resource)),
            _ => None,
        };

        if let (Some((tenant, _)), Some(key)) = (&metered, idempotency_key.clone()) {
            if let Some(original) = self.quota.replayed(tenant, &key).await? {
                if let Some(row) = self.replayed_row(repo, entity, tenant, &original).await? {
                    return Ok(row);
                }
                warn!(tenant_id = %tenant, entity, "idempotency key reused for a missing resource, creating anew");
                idempotency_key = None;
            }
        }

        let reservation = match &metered {
            Some((tenant, resource)) => Some(
                self.quota
                    .check_and_record_quota(tenant, *resource, idempotency_key.clone())
                    .await?,
            ),
            None => None,
        };

        let created = repo.create(entity, doc).await?;

        if let Some(reservation) = reservation {
            let tenant = reservation.tenant().clone();
            let resource = reservation.resource();
            let outcome = reservation
                .commit(usage_metadata(entity, &created))
                .await
                .inspect_err(|e| error!(entity, error = %e, "resource created but usage not recorded"))?;
            if outcome == AppendOutcome::Duplicate {
                if let Some(key) = idempotency_key.as_deref() {
                    return self
                        .settle_concurrent_replay(repo, entity, &tenant, resource, key, created)
                        .await;
                }
            }
        }
        self.after_write(entity, "created", std::slice::from_ref(&created))
            .await;
        Ok(created)
    }

    /// The row an earlier creation recorded under the same idempotency key,
    /// if it still exists and is of the same entity.
    async fn replayed_row(
        &self,
        repo: &ScopedRepository,
        entity: &str,
        tenant: &TenantId,
        original: &QuotaLedgerEntry,
    ) -> Result<Option<Document>, TenancyError> {
        if original.metadata.get("entity").and_then(Value::as_str) != Some(entity) {
            return Ok(None);
        }
        let Some(id) = original.metadata.get("id").cloned() else {
            return Ok(None);
        };
        let filter = Filter::eq(ID_ATTRIBUTE, id).and(Filter::eq(TENANT_ATTRIBUTE, tenant.as_str()));
        repo.find_one(entity, filter).await
    }

    /// Another request recorded the same key while this one was creating.
    /// The earlier row wins and this one is removed; if the earlier row
    /// cannot be found, this row stays and is metered without the key.
    async fn settle_concurrent_replay(
        &self,
        repo: &ScopedRepository,
        entity: &str,
        tenant: &TenantId,
        resource: ResourceType,
        key: &str,
        created: Document,
    ) -> Result<Document, TenancyError> {
        if let Some(original) = self.quota.replayed(tenant, key).await? {
            if let Some(row) = self.replayed_row(repo, entity, tenant, &original).await? {
                if let Some(id) = created.get(ID_ATTRIBUTE).and_then(Value::as_str) {
                    repo.delete(entity, id).await?;
                }
                return Ok(row);
            }
        }
        self.quota
            .record_usage(tenant, resource, 1, usage_metadata(entity, &created), None)
            .await?;
        self.after_write(entity, "created", std::slice::from_ref(&created))
            .await;
        Ok(created)
    }

    async fn create_many(
        &self,
        repo: &ScopedRepository,
        entity: &str,
        docs: Vec<Document>,
    ) -> Result<Vec<Document>, TenancyError> {
        let mut per_tenant: BTreeMap<TenantId, u64> = BTreeMap::new();
        let resource = ResourceType::for_entity(entity);
        if resource.is_some() {
            for doc in &docs {
                if let Some(tenant) = metering_tenant(repo.context(), doc) {
                    *per_tenant.entry(tenant).or_default() += 1;
                }
            }
        }
        if let Some(resource) = resource {
            for (tenant, quantity) in &per_tenant {
                self.quota.check_headroom(tenant, resource, *quantity).await?;
            }
        }

        let created = repo.create_many(entity, docs).await?;

        if let Some(resource) = resource {
            for (tenant, quantity) in per_tenant {
                let mut metadata = Document::new();
                metadata.insert("entity".to_string(), Value::from(entity));
                metadata.insert("bulk".to_string(), Value::Bool(true));
                self.quota
                    .record_usage(&tenant, resource, quantity, metadata, None)
                    .await?;
            }
        }
        self.after_write(entity, "created", &created).await;
        Ok(created)
    }

    async fn find(
        &self,
        repo: &ScopedRepository,
        entity: &str,
        query: FindQuery,
    ) -> Result<Page, TenancyError> {
        // Joined rows come from other entities whose writes do not
        // invalidate this entity's namespace.
        if !query.include.is_empty() {
            return repo.find(entity, query).await;
        }
        let local = serde_json::to_string(&query).ok().map(|q| format!("find:{q}"));
        let Some(key) = local.and_then(|l| self.read_key(repo.context(), entity, &l)) else {
            return repo.find(entity, query).await;
        };
        let page = self
            .cache
            .get_or_fetch(&key, FetchOptions::default(), || async {
                repo.find(entity, query).await.map(Some)
            })
            .await?;
        Ok(page.unwrap_or_default())
    }

    async fn count(
        &self,
        repo: &ScopedRepository,
        entity: &str,
        filter: Filter,
    ) -> Result<u64, TenancyError> {
        let local = serde_json::to_string(&filter).ok().map(|f| format!("count:{f}"));
        let Some(key) = local.and_then(|l| self.read_key(repo.context(), entity, &l)) else {
            return repo.count(entity, filter).await;
        };
        let count = self
            .cache
            .get_or_fetch(&key, FetchOptions::default(), || async {
                repo.count(entity, filter).await.map(Some)
            })
            .await?;
        Ok(count.unwrap_or_default())
    }

    /// Cache key for a read, or `None` when the read must not be cached.
    /// Override reads span tenants and are never cached.
    fn read_key(&self, ctx: &RequestContext, entity: &str, local: &str) -> Option<CacheKey> {
        if !self.data.registry().is_tenant_scoped(entity) {
            return CacheKey::global(entity, local).ok();
        }
        if ctx.is_system_override() {
            return None;
        }
        CacheKey::tenant(ctx.tenant()?, entity, local).ok()
    }

    /// Invalidates cached reads and notifies every tenant owning a changed row.
    async fn after_write(&self, entity: &str, action: &str, rows: &[Document]) {
        if rows.is_empty() {
            return;
        }
        let event = format!("{entity}.{action}");

        let mut by_tenant: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        let mut unowned = Vec::new();
        for row in rows {
            match row.get(TENANT_ATTRIBUTE).and_then(Value::as_str) {
                Some(t) => by_tenant
                    .entry(t.to_string())
                    .or_default()
                    .push(Value::Map(row.clone())),
                None => unowned.push(Value::Map(row.clone())),
            }
        }

        for (raw, items) in by_tenant {
            let Ok(tenant) = TenantId::parse(raw) else {
                continue;
            };
            if let Err(e) = self.cache.invalidate_namespace(&tenant, entity).await {
                error!(tenant_id = %tenant, entity, error = %e, "cache invalidation failed");
            }
            self.rooms.emit_to_tenant(&tenant, &event, Value::Array(items));
        }

        if !unowned.is_empty() {
            if let Err(e) = self.cache.invalidate_global_namespace(entity).await {
                error!(entity, error = %e, "global cache invalidation failed");
            }
            if self.data.registry().is_tenant_scoped(entity) {
                warn!(entity, rows = unowned.len(), "tenant-scoped rows without owner, event withheld");
            } else {
                self.rooms.emit_to_admins(&event, Value::Array(unowned));
            }
        }
    }
}

impl Service<Operation> for RecordService {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = OperationFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let svc = self.clone();
        Box::pin(async move {
            let output = svc.handle(op).await?;
            Ok(OperationResponse::from(output))
        })
    }
}

fn bound_tenant(
    ctx: &RequestContext,
    entity: &str,
    operation: &'static str,
) -> Result<TenantId, TenancyError> {
    ctx.tenant()
        .cloned()
        .ok_or_else(|| TenancyError::MissingTenantContext {
            entity: entity.to_string(),
            operation,
        })
}

/// Tenant whose allowance a new row consumes. An override may create rows
/// for any tenant, so the row's own owner is charged.
fn metering_tenant(ctx: &RequestContext, doc: &Document) -> Option<TenantId> {
    if ctx.is_system_override() {
        if let Some(owner) = doc.get(TENANT_ATTRIBUTE).and_then(Value::as_str) {
            return TenantId::parse(owner).ok();
        }
    }
    ctx.tenant().cloned()
}

fn usage_metadata(entity: &str, created: &Document) -> Document {
    let mut metadata = Document::new();
    metadata.insert("entity".to_string(), Value::from(entity));
    if let Some(id) = created.get(ID_ATTRIBUTE) {
        metadata.insert("id".to_string(), id.clone());
    }
    metadata
}
