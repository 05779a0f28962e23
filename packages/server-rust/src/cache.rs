//! Tenant-namespaced read-through cache over the [`SharedStore`].
//!
//! [`CacheKey`] has no public fields and only two constructors, so a key for
//! tenant-scoped data cannot be built without the tenant segment. Global data
//! goes under the `_global` sentinel, which no [`TenantId`] can spell.
//!
//! Key layout: `cache:{tenant|_global}:{namespace}:{local}`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use hse_core::TenantId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

use crate::error::TenancyError;
use crate::store::{SharedStore, StoreError};

/// Tenant segment used for data that is not tenant-scoped.
pub const GLOBAL_SEGMENT: &str = "_global";

const KEY_PREFIX: &str = "cache";
const MAX_NAMESPACE_LEN: usize = 64;
/// Local keys longer than this are replaced by their SHA-256 digest.
const MAX_LOCAL_KEY_LEN: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid cache namespace {0:?}")]
    InvalidNamespace(String),
    #[error("empty cache key")]
    EmptyKey,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cache encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

impl From<CacheError> for TenancyError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Store(e) => TenancyError::SharedStoreUnavailable(e),
            other => TenancyError::Backend(anyhow::Error::new(other)),
        }
    }
}

/// A fully qualified cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    full: String,
}

impl CacheKey {
    /// Key for tenant-scoped data.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if `namespace` is not `[A-Za-z0-9_.-]{1,64}` or
    /// `key` is empty.
    pub fn tenant(tenant: &TenantId, namespace: &str, key: &str) -> Result<Self, CacheError> {
        Self::build(tenant.as_str(), namespace, key)
    }

    /// Key for data shared by every tenant (plan tables, reference data).
    ///
    /// # Errors
    ///
    /// See [`CacheKey::tenant`].
    pub fn global(namespace: &str, key: &str) -> Result<Self, CacheError> {
        Self::build(GLOBAL_SEGMENT, namespace, key)
    }

    fn build(segment: &str, namespace: &str, key: &str) -> Result<Self, CacheError> {
        validate_namespace(namespace)?;
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }
        let local = if key.len() > MAX_LOCAL_KEY_LEN {
            format!("sha256-{}", hex::encode(Sha256::digest(key.as_bytes())))
        } else {
            key.to_string()
        };
        Ok(Self {
            full: format!("{KEY_PREFIX}:{segment}:{namespace}:{local}"),
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

fn validate_namespace(namespace: &str) -> Result<(), CacheError> {
    let ok = !namespace.is_empty()
        && namespace.len() <= MAX_NAMESPACE_LEN
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if ok {
        Ok(())
    } else {
        Err(CacheError::InvalidNamespace(namespace.to_string()))
    }
}

fn namespace_prefix(segment: &str, namespace: &str) -> Result<String, CacheError> {
    validate_namespace(namespace)?;
    Ok(format!("{KEY_PREFIX}:{segment}:{namespace}:"))
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
        }
    }
}

/// Options for [`CacheManager::get_or_fetch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Overrides the default TTL.
    pub ttl: Option<Duration>,
    /// Also cache a `None` fetch result. Off by default so a transient miss
    /// does not become a sticky one.
    pub cache_absent: bool,
}

impl FetchOptions {
    #[must_use]
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            cache_absent: false,
        }
    }

    #[must_use]
    pub fn cache_absent(mut self) -> Self {
        self.cache_absent = true;
        self
    }
}

pub struct CacheManager {
    store: Arc<dyn SharedStore>,
    config: CacheConfig,
}

impl CacheManager {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    /// Raw lookup. Outer `None` is a miss; `Some(None)` is a cached absence.
    async fn lookup<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
    ) -> Result<Option<Option<T>>, CacheError> {
        let Some(bytes) = self.store.get(key.as_str()).await? else {
            return Ok(None);
        };
        match rmp_serde::from_slice::<Option<T>>(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                // Entry written by an incompatible version: drop it and miss.
                warn!(key = %key, error = %e, "undecodable cache entry evicted");
                self.store.delete(key.as_str()).await?;
                Ok(None)
            }
        }
    }

    async fn store_value<T: Serialize>(
        &self,
        key: &CacheKey,
        value: Option<&T>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let bytes = rmp_serde::to_vec_named(&value)?;
        self.store
            .set_ex(key.as_str(), bytes, ttl.unwrap_or(self.config.default_ttl))
            .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store is unreachable.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
        Ok(self.lookup(key).await?.flatten())
    }

    /// # Errors
    ///
    /// Returns [`CacheError`] if encoding fails or the store is unreachable.
    pub async fn set<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.store_value(key, Some(value), ttl).await
    }

    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the store is unreachable.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(self.store.delete(key.as_str()).await?)
    }

    /// Deletes every key under `tenant` + `namespace`. Other tenants' keys in
    /// the same namespace are untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on an invalid namespace or store failure.
    pub async fn invalidate_namespace(
        &self,
        tenant: &TenantId,
        namespace: &str,
    ) -> Result<u64, CacheError> {
        let prefix = namespace_prefix(tenant.as_str(), namespace)?;
        let removed = self.store.delete_prefix(&prefix).await?;
        debug!(tenant_id = %tenant, namespace, removed, "cache namespace invalidated");
        Ok(removed)
    }

    /// Deletes every key under the global sentinel + `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] on an invalid namespace or store failure.
    pub async fn invalidate_global_namespace(&self, namespace: &str) -> Result<u64, CacheError> {
        let prefix = namespace_prefix(GLOBAL_SEGMENT, namespace)?;
        Ok(self.store.delete_prefix(&prefix).await?)
    }

    /// Read-through: returns the cached value, or calls `fetch` on a miss
    /// and stores its result.
    ///
    /// Fetch errors are returned as-is and never cached. A store outage
    /// degrades to calling `fetch` directly.
    ///
    /// # Errors
    ///
    /// Returns whatever `fetch` returns, or an encode failure.
    pub async fn get_or_fetch<T, F, Fut, E>(
        &self,
        key: &CacheKey,
        options: FetchOptions,
        fetch: F,
    ) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: From<CacheError>,
    {
        match self.lookup::<T>(key).await {
            Ok(Some(hit)) => return Ok(hit),
            Ok(None) => {}
            Err(CacheError::Store(e)) => {
                metrics::counter!("hse_shared_store_errors_total", "op" => "cache_get").increment(1);
                error!(key = %key, error = %e, "cache read failed, bypassing cache");
                return fetch().await;
            }
            Err(e) => return Err(e.into()),
        }

        let fetched = fetch().await?;
        if fetched.is_some() || options.cache_absent {
            match self.store_value(key, fetched.as_ref(), options.ttl).await {
                Ok(()) => {}
                Err(CacheError::Store(e)) => {
                    metrics::counter!("hse_shared_store_errors_total", "op" => "cache_set")
                        .increment(1);
                    error!(key = %key, error = %e, "cache write failed");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(fetched)
    }
}
