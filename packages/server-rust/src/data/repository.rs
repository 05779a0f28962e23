//! Pre-scoped data handles for business logic.
//!
//! [`TenantDataClient`] is the only public entry point to persistence. It
//! cannot run a query itself; it hands out a [`ScopedRepository`] bound to one
//! [`RequestContext`], and every method on that repository goes through the
//! [`TenantInterceptor`]. There is no way to obtain an unscoped handle.

use std::sync::Arc;

use hse_core::{Document, Filter, RequestContext};

use super::backend::{FindQuery, Page};
use super::entity::EntityRegistry;
use super::interceptor::TenantInterceptor;
use crate::context;
use crate::error::TenancyError;

#[derive(Clone)]
pub struct TenantDataClient {
    interceptor: Arc<TenantInterceptor>,
}

impl TenantDataClient {
    #[must_use]
    pub fn new(interceptor: Arc<TenantInterceptor>) -> Self {
        Self { interceptor }
    }

    /// Entity catalogue the interceptor scopes by.
    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        self.interceptor.registry()
    }

    /// Repository bound to an explicit context.
    #[must_use]
    pub fn scoped(&self, ctx: RequestContext) -> ScopedRepository {
        ScopedRepository {
            interceptor: Arc::clone(&self.interceptor),
            ctx,
        }
    }

    /// Repository bound to the task-local context. Outside any bound scope
    /// this is an anonymous context, which fails closed.
    #[must_use]
    pub fn current(&self) -> ScopedRepository {
        let ctx = context::current()
            .unwrap_or_else(|| RequestContext::anonymous(uuid::Uuid::new_v4().to_string()));
        self.scoped(ctx)
    }
}

/// Data access scoped to one request context.
#[derive(Clone)]
pub struct ScopedRepository {
    interceptor: Arc<TenantInterceptor>,
    ctx: RequestContext,
}

impl ScopedRepository {
    #[must_use]
    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    /// # Errors
    ///
    /// `MissingTenantContext` with no bound tenant, `CrossTenantAccess` for a
    /// foreign tenant attribute, `Backend` on storage failure.
    pub async fn create(&self, entity: &str, doc: Document) -> Result<Document, TenancyError> {
        self.interceptor.create(&self.ctx, entity, doc).await
    }

    /// # Errors
    ///
    /// As [`create`](Self::create), for any item; nothing is written then.
    pub async fn create_many(
        &self,
        entity: &str,
        docs: Vec<Document>,
    ) -> Result<Vec<Document>, TenancyError> {
        self.interceptor.create_many(&self.ctx, entity, docs).await
    }

    /// # Errors
    ///
    /// `CrossTenantAccess`, `MissingTenantContext` (fail-loud policy only) or
    /// `Backend`.
    pub async fn find(&self, entity: &str, query: FindQuery) -> Result<Page, TenancyError> {
        self.interceptor.find(&self.ctx, entity, query).await
    }

    /// # Errors
    ///
    /// See [`find`](Self::find).
    pub async fn find_one(
        &self,
        entity: &str,
        filter: Filter,
    ) -> Result<Option<Document>, TenancyError> {
        self.interceptor.find_one(&self.ctx, entity, filter).await
    }

    /// Updates one row by id. `None` if no row with that id is visible.
    ///
    /// # Errors
    ///
    /// `CrossTenantAccess` if the patch reassigns the tenant,
    /// `MissingTenantContext`, or `Backend`.
    pub async fn update(
        &self,
        entity: &str,
        id: &str,
        patch: Document,
    ) -> Result<Option<Document>, TenancyError> {
        self.interceptor.update(&self.ctx, entity, id, patch).await
    }

    /// # Errors
    ///
    /// See [`update`](Self::update).
    pub async fn update_many(
        &self,
        entity: &str,
        filter: Filter,
        patch: Document,
    ) -> Result<Vec<Document>, TenancyError> {
        self.interceptor
            .update_many(&self.ctx, entity, filter, patch)
            .await
    }

    /// # Errors
    ///
    /// `MissingTenantContext` or `Backend`.
    pub async fn delete(&self, entity: &str, id: &str) -> Result<Option<Document>, TenancyError> {
        self.interceptor.delete(&self.ctx, entity, id).await
    }

    /// # Errors
    ///
    /// `CrossTenantAccess`, `MissingTenantContext` or `Backend`.
    pub async fn delete_many(
        &self,
        entity: &str,
        filter: Filter,
    ) -> Result<Vec<Document>, TenancyError> {
        self.interceptor.delete_many(&self.ctx, entity, filter).await
    }

    /// # Errors
    ///
    /// See [`find`](Self::find).
    pub async fn count(&self, entity: &str, filter: Filter) -> Result<u64, TenancyError> {
        self.interceptor.count(&self.ctx, entity, filter).await
    }
}
