use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, AnyPool, Row};
use uuid::Uuid;

use crate::models::{Error, TenantId};
use crate::storage::row;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr)]
pub struct SuppressionId(Uuid);

impl SuppressionId {
    pub fn new() -> Self {
        SuppressionId(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuppressionReason {
    HardBounce,
    Complaint,
    Unsubscribe,
    Manual,
    InvalidRecipient,
}

impl SuppressionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressionReason::HardBounce => "hard-bounce",
            SuppressionReason::Complaint => "complaint",
            SuppressionReason::Unsubscribe => "unsubscribe",
            SuppressionReason::Manual => "manual",
            SuppressionReason::InvalidRecipient => "invalid-recipient",
        }
    }

    fn parse(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "hard-bounce" => SuppressionReason::HardBounce,
            "complaint" => SuppressionReason::Complaint,
            "unsubscribe" => SuppressionReason::Unsubscribe,
            "manual" => SuppressionReason::Manual,
            "invalid-recipient" => SuppressionReason::InvalidRecipient,
            other => return Err(Error::Internal(format!("unknown suppression reason {other}"))),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SuppressionEntry {
    pub id: SuppressionId,
    pub tenant_id: TenantId,
    pub address: String,
    pub reason: SuppressionReason,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

fn suppression_from_row(row_: &AnyRow) -> Result<SuppressionEntry, Error> {
    Ok(SuppressionEntry {
        id: row::uuid(row_, "id")?.into(),
        tenant_id: row::uuid(row_, "tenant_id")?.into(),
        address: row_.try_get("address")?,
        reason: SuppressionReason::parse(&row_.try_get::<String, _>("reason")?)?,
        source: row_.try_get("source")?,
        created_at: row::datetime(row_, "created_at")?,
        expires_at: row::datetime_opt(row_, "expires_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct SuppressionRepository {
    pool: AnyPool,
}

impl SuppressionRepository {
    pub fn new(pool: AnyPool) -> Self {
        SuppressionRepository { pool }
    }

    /// Inserts or refreshes a suppression entry for `address`. Re-suppressing
    /// an already-suppressed address (e.g. a second hard bounce) replaces the
    /// reason/expiry rather than accumulating duplicate rows.
    pub async fn suppress(
        &self,
        tenant_id: TenantId,
        address: &str,
        reason: SuppressionReason,
        source: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<SuppressionEntry, Error> {
        let id = SuppressionId::new();
        let now = row::now_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO suppression_entries (id, tenant_id, address, reason, source, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (tenant_id, address) DO UPDATE SET
                reason = excluded.reason,
                source = excluded.source,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .bind(address)
        .bind(reason.as_str())
        .bind(source)
        .bind(&now)
        .bind(expires_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        let row_ = sqlx::query("SELECT * FROM suppression_entries WHERE tenant_id = ? AND address = ?")
            .bind(tenant_id.to_string())
            .bind(address)
            .fetch_one(&self.pool)
            .await?;
        suppression_from_row(&row_)
    }

    /// Returns whether `address` is currently suppressed for `tenant_id`
    /// (i.e. an entry exists and, if it has an expiry, it hasn't passed).
    /// This is the check the pipeline runs before enqueueing any send.
    pub async fn is_suppressed(&self, tenant_id: TenantId, address: &str) -> Result<bool, Error> {
        let now = row::now_rfc3339();
        let row_ = sqlx::query(
            "SELECT 1 as present FROM suppression_entries WHERE tenant_id = ? AND address = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(tenant_id.to_string())
        .bind(address)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row_.is_some())
    }

    pub async fn list(&self, tenant_id: TenantId) -> Result<Vec<SuppressionEntry>, Error> {
        let rows = sqlx::query("SELECT * FROM suppression_entries WHERE tenant_id = ? ORDER BY created_at DESC")
            .bind(tenant_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(suppression_from_row).collect()
    }

    pub async fn remove(&self, tenant_id: TenantId, address: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM suppression_entries WHERE tenant_id = ? AND address = ?")
            .bind(tenant_id.to_string())
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{NewTenant, Plan, TenantRepository};

    async fn memory_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn suppress_and_check() {
        let pool = memory_pool().await;
        let tenant = TenantRepository::new(pool.clone())
            .create(NewTenant { name: "Acme".into(), plan: Plan::Free })
            .await
            .unwrap();
        let repo = SuppressionRepository::new(pool);

        assert!(!repo.is_suppressed(tenant.id, "bounced@example.net").await.unwrap());

        repo.suppress(tenant.id, "bounced@example.net", SuppressionReason::HardBounce, "bounce-classifier", None)
            .await
            .unwrap();

        assert!(repo.is_suppressed(tenant.id, "bounced@example.net").await.unwrap());

        repo.remove(tenant.id, "bounced@example.net").await.unwrap();
        assert!(!repo.is_suppressed(tenant.id, "bounced@example.net").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entry_not_suppressed() {
        let pool = memory_pool().await;
        let tenant = TenantRepository::new(pool.clone())
            .create(NewTenant { name: "Acme".into(), plan: Plan::Free })
            .await
            .unwrap();
        let repo = SuppressionRepository::new(pool);

        let past = Utc::now() - chrono::Duration::hours(1);
        repo.suppress(tenant.id, "temp@example.net", SuppressionReason::Manual, "admin", Some(past))
            .await
            .unwrap();

        assert!(!repo.is_suppressed(tenant.id, "temp@example.net").await.unwrap());
    }
}
