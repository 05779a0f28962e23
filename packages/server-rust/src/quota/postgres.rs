//! Postgres-backed quota ledger.
//!
//! Rows are insert-only. Idempotency is enforced by a partial unique index on
//! `(tenant_id, idempotency_key)`, so concurrent replays across instances
//! collapse to one row inside the database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hse_core::{BillingPeriod, Document, QuotaLedgerEntry, ResourceType, TenantId};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::info;

use super::{AppendOutcome, QuotaLedger};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS quota_ledger (
        id BIGSERIAL PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        resource TEXT NOT NULL,
        quantity BIGINT NOT NULL CHECK (quantity >= 0),
        recorded_at TIMESTAMPTZ NOT NULL,
        idempotency_key TEXT,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS quota_ledger_idempotency
        ON quota_ledger (tenant_id, idempotency_key)
        WHERE idempotency_key IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS quota_ledger_lookup
        ON quota_ledger (tenant_id, resource, recorded_at)",
];

#[derive(FromRow)]
struct LedgerRow {
    tenant_id: String,
    resource: String,
    quantity: i64,
    recorded_at: DateTime<Utc>,
    idempotency_key: Option<String>,
    metadata: Json<Document>,
}

impl TryFrom<LedgerRow> for QuotaLedgerEntry {
    type Error = anyhow::Error;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(QuotaLedgerEntry {
            tenant_id: TenantId::parse(row.tenant_id)?,
            resource: row.resource.parse()?,
            quantity: u64::try_from(row.quantity)?,
            recorded_at: row.recorded_at,
            idempotency_key: row.idempotency_key,
            metadata: row.metadata.0,
        })
    }
}

#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Connects and ensures the ledger table exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable or DDL fails.
    pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let ledger = Self { pool };
        ledger.migrate().await?;
        info!("quota ledger ready on postgres");
        Ok(ledger)
    }

    /// Wraps an existing pool. The caller is responsible for [`migrate`](Self::migrate).
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the table and indexes if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if any DDL statement fails.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaLedger for PostgresLedger {
    async fn append(&self, entry: QuotaLedgerEntry) -> anyhow::Result<AppendOutcome> {
        let result = sqlx::query(
            "INSERT INTO quota_ledger
                (tenant_id, resource, quantity, recorded_at, idempotency_key, metadata)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (tenant_id, idempotency_key) WHERE idempotency_key IS NOT NULL
             DO NOTHING",
        )
        .bind(entry.tenant_id.as_str())
        .bind(entry.resource.as_str())
        .bind(i64::try_from(entry.quantity)?)
        .bind(entry.recorded_at)
        .bind(entry.idempotency_key.as_deref())
        .bind(Json(&entry.metadata))
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 0 {
            AppendOutcome::Duplicate
        } else {
            AppendOutcome::Appended
        })
    }

    async fn sum(
        &self,
        tenant: &TenantId,
        resource: ResourceType,
        period: &BillingPeriod,
    ) -> anyhow::Result<u64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM quota_ledger
             WHERE tenant_id = $1 AND resource = $2
               AND recorded_at >= $3 AND recorded_at < $4",
        )
        .bind(tenant.as_str())
        .bind(resource.as_str())
        .bind(period.start)
        .bind(period.end)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(total)?)
    }

    async fn entries(
        &self,
        tenant: &TenantId,
        resource: ResourceType,
        period: &BillingPeriod,
    ) -> anyhow::Result<Vec<QuotaLedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            "SELECT tenant_id, resource, quantity, recorded_at, idempotency_key, metadata
             FROM quota_ledger
             WHERE tenant_id = $1 AND resource = $2
               AND recorded_at >= $3 AND recorded_at < $4
             ORDER BY recorded_at, id",
        )
        .bind(tenant.as_str())
        .bind(resource.as_str())
        .bind(period.start)
        .bind(period.end)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(QuotaLedgerEntry::try_from).collect()
    }

    async fn find_key(
        &self,
        tenant: &TenantId,
        idempotency_key: &str,
    ) -> anyhow::Result<Option<QuotaLedgerEntry>> {
        let row = sqlx::query_as::<_, LedgerRow>(
            "SELECT tenant_id, resource, quantity, recorded_at, idempotency_key, metadata
             FROM quota_ledger
             WHERE tenant_id = $1 AND idempotency_key = $2",
        )
        .bind(tenant.as_str())
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(QuotaLedgerEntry::try_from).transpose()
    }
}
