//! Persistence seam beneath the tenant interceptor.
//!
//! A [`DataBackend`] executes exactly the filters it is given. It knows
//! nothing about tenants; scoping is the interceptor's job, and the only
//! public path to a backend goes through it.

use async_trait::async_trait;
use hse_core::{Document, Filter};
use serde::{Deserialize, Serialize};

/// Upper bound on one page, whatever the caller asks for.
pub const MAX_PAGE_SIZE: usize = 1_000;

/// A join into another entity type.
///
/// For each row, rows of `entity` whose `foreign_field` equals the row's
/// `local_field` and which match `filter` are attached under `entity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Include {
    pub entity: String,
    pub local_field: String,
    pub foreign_field: String,
    #[serde(default)]
    pub filter: Filter,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindQuery {
    #[serde(default)]
    pub filter: Filter,
    pub limit: Option<usize>,
    /// Opaque position returned as `next_cursor` by the previous page.
    pub cursor: Option<String>,
    #[serde(default)]
    pub include: Vec<Include>,
}

impl FindQuery {
    #[must_use]
    pub fn filter(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    #[must_use]
    pub fn include(mut self, include: Include) -> Self {
        self.include.push(include);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<Document>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Storage for entity rows.
///
/// Used as `Arc<dyn DataBackend>`.
#[async_trait]
pub trait DataBackend: Send + Sync {
    /// Inserts one row, assigning an id if it has none. Returns the stored row.
    async fn insert(&self, entity: &str, doc: Document) -> anyhow::Result<Document>;

    /// Rows matching `query.filter`, ordered by id, with includes resolved.
    async fn find(&self, entity: &str, query: &FindQuery) -> anyhow::Result<Page>;

    /// Merges `patch` into every matching row. Returns the updated rows.
    async fn update(
        &self,
        entity: &str,
        filter: &Filter,
        patch: &Document,
    ) -> anyhow::Result<Vec<Document>>;

    /// Deletes every matching row. Returns the removed rows.
    async fn delete(&self, entity: &str, filter: &Filter) -> anyhow::Result<Vec<Document>>;

    async fn count(&self, entity: &str, filter: &Filter) -> anyhow::Result<u64>;
}
