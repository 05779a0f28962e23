//! In-memory [`DataBackend`] backed by [`DashMap`].
//!
//! One ordered table per entity type. Rows are kept in id order so keyset
//! pagination over `next_cursor` is stable while rows are added.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use hse_core::{Document, Filter, Value};

use super::backend::{DataBackend, FindQuery, Include, Page, MAX_PAGE_SIZE};
use super::entity::ID_ATTRIBUTE;

type Table = BTreeMap<String, Document>;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: DashMap<String, Table>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored row of `entity`, unfiltered. Test inspection only; not
    /// reachable from request handling.
    #[must_use]
    pub fn raw_rows(&self, entity: &str) -> Vec<Document> {
        self.tables
            .get(entity)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    fn select(&self, entity: &str, filter: &Filter) -> Vec<Document> {
        self.tables
            .get(entity)
            .map(|t| t.values().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default()
    }

    fn resolve_include(&self, rows: &mut [Document], include: &Include) {
        // Collected before touching `rows`: the joined table may be the same one.
        let candidates = self.select(&include.entity, &include.filter);
        for row in rows {
            let local = row.get(&include.local_field).cloned().unwrap_or(Value::Null);
            let joined: Vec<Value> = candidates
                .iter()
                .filter(|c| local != Value::Null && c.get(&include.foreign_field) == Some(&local))
                .cloned()
                .map(Value::Map)
                .collect();
            row.insert(include.entity.clone(), Value::Array(joined));
        }
    }
}

fn row_id(doc: &Document) -> Option<String> {
    match doc.get(ID_ATTRIBUTE)? {
        Value::String(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

#[async_trait]
impl DataBackend for MemoryBackend {
    async fn insert(&self, entity: &str, mut doc: Document) -> anyhow::Result<Document> {
        let id = match row_id(&doc) {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                doc.insert(ID_ATTRIBUTE.to_string(), Value::String(id.clone()));
                id
            }
        };
        let mut table = self.tables.entry(entity.to_string()).or_default();
        if table.contains_key(&id) {
            anyhow::bail!("{entity} {id} already exists");
        }
        table.insert(id, doc.clone());
        Ok(doc)
    }

    async fn find(&self, entity: &str, query: &FindQuery) -> anyhow::Result<Page> {
        let limit = query.limit.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE);
        let (mut items, has_more) = {
            let Some(table) = self.tables.get(entity) else {
                return Ok(Page::default());
            };
            let start = query.cursor.as_deref();
            let mut matching = table
                .iter()
                .filter(|(id, _)| start.is_none_or(|c| id.as_str() > c))
                .filter(|(_, d)| query.filter.matches(d))
                .map(|(_, d)| d.clone());
            let items: Vec<Document> = matching.by_ref().take(limit).collect();
            let has_more = matching.next().is_some();
            (items, has_more)
        };

        let next_cursor = if has_more {
            items.last().and_then(row_id)
        } else {
            None
        };
        for include in &query.include {
            self.resolve_include(&mut items, include);
        }
        Ok(Page {
            items,
            next_cursor,
            has_more,
        })
    }

    async fn update(
        &self,
        entity: &str,
        filter: &Filter,
        patch: &Document,
    ) -> anyhow::Result<Vec<Document>> {
        let Some(mut table) = self.tables.get_mut(entity) else {
            return Ok(Vec::new());
        };
        let mut updated = Vec::new();
        for doc in table.values_mut().filter(|d| filter.matches(d)) {
            for (k, v) in patch {
                if k != ID_ATTRIBUTE {
                    doc.insert(k.clone(), v.clone());
                }
            }
            updated.push(doc.clone());
        }
        Ok(updated)
    }

    async fn delete(&self, entity: &str, filter: &Filter) -> anyhow::Result<Vec<Document>> {
        let Some(mut table) = self.tables.get_mut(entity) else {
            return Ok(Vec::new());
        };
        let doomed: Vec<String> = table
            .iter()
            .filter(|(_, d)| filter.matches(d))
            .map(|(id, _)| id.clone())
            .collect();
        Ok(doomed.iter().filter_map(|id| table.remove(id)).collect())
    }

    async fn count(&self, entity: &str, filter: &Filter) -> anyhow::Result<u64> {
        Ok(self
            .tables
            .get(entity)
            .map_or(0, |t| t.values().filter(|d| filter.matches(d)).count() as u64))
    }
}
