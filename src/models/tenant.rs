use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, AnyPool, Row};
use uuid::Uuid;

use crate::models::Error;
use crate::storage::row;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr)]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new() -> Self {
        TenantId(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

/// Plan determines default rate-limit/quota tiers (see `rate_limiter.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Pro,
    Business,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Business => "business",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "free" => Ok(Plan::Free),
            "pro" => Ok(Plan::Pro),
            "business" => Ok(Plan::Business),
            other => Err(Error::Internal(format!("unknown plan {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quotas {
    /// Maximum emails this tenant may have enqueued per calendar day.
    pub daily_send_limit: i64,
    pub used_today: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub plan: Plan,
    pub quotas: Quotas,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct NewTenant {
    pub name: String,
    pub plan: Plan,
}

fn default_quota_for(plan: Plan) -> i64 {
    match plan {
        Plan::Free => 200,
        Plan::Pro => 50_000,
        Plan::Business => 1_000_000,
    }
}

fn tenant_from_row(row_: &AnyRow) -> Result<Tenant, Error> {
    Ok(Tenant {
        id: row::uuid(row_, "id")?.into(),
        name: row_.try_get("name")?,
        plan: Plan::parse(&row_.try_get::<String, _>("plan")?)?,
        quotas: Quotas {
            daily_send_limit: row_.try_get("daily_send_limit")?,
            used_today: row_.try_get("used_today")?,
        },
        created_at: row::datetime(row_, "created_at")?,
        updated_at: row::datetime(row_, "updated_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct TenantRepository {
    pool: AnyPool,
}

impl TenantRepository {
    pub fn new(pool: AnyPool) -> Self {
        TenantRepository { pool }
    }

    pub async fn create(&self, new: NewTenant) -> Result<Tenant, Error> {
        let id = TenantId::new();
        let now = row::now_rfc3339();
        let quota = default_quota_for(new.plan);

        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, plan, daily_send_limit, used_today, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&new.name)
        .bind(new.plan.as_str())
        .bind(quota)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(id).await?.ok_or(Error::NotFound("tenant not found after insert"))
    }

    pub async fn get(&self, id: TenantId) -> Result<Option<Tenant>, Error> {
        let row_ = sqlx::query("SELECT * FROM tenants WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row_.as_ref().map(tenant_from_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Tenant>, Error> {
        let rows = sqlx::query("SELECT * FROM tenants ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(tenant_from_row).collect()
    }

    /// Admin-only: tears down a tenant and (via `ON DELETE CASCADE`, see
    /// migrations) all data it owns, transitively.
    pub async fn remove(&self, id: TenantId) -> Result<(), Error> {
        sqlx::query("DELETE FROM tenants WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically increments `used_today` and returns whether the tenant is
    /// still within its daily quota. Used by the rate limiter's
    /// `tenant/day` scope.
    pub async fn try_consume_daily_quota(&self, id: TenantId) -> Result<bool, Error> {
        let row_ = sqlx::query(
            r#"
            UPDATE tenants
            SET used_today = used_today + 1
            WHERE id = ? AND used_today < daily_send_limit
            RETURNING used_today
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row_.is_some())
    }

    pub async fn reset_daily_quotas(&self) -> Result<u64, Error> {
        let result = sqlx::query("UPDATE tenants SET used_today = 0")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn memory_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn tenant_lifecycle() {
        let pool = memory_pool().await;
        let repo = TenantRepository::new(pool);

        let tenant = repo
            .create(NewTenant { name: "Acme".into(), plan: Plan::Free })
            .await
            .unwrap();
        assert_eq!(tenant.name, "Acme");
        assert_eq!(tenant.quotas.daily_send_limit, 200);

        let fetched = repo.get(tenant.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, tenant.id);

        repo.remove(tenant.id).await.unwrap();
        assert!(repo.get(tenant.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn daily_quota_enforced() {
        let pool = memory_pool().await;
        let repo = TenantRepository::new(pool);
        let tenant = repo
            .create(NewTenant { name: "Small".into(), plan: Plan::Free })
            .await
            .unwrap();

        for _ in 0..200 {
            assert!(repo.try_consume_daily_quota(tenant.id).await.unwrap());
        }
        assert!(!repo.try_consume_daily_quota(tenant.id).await.unwrap());
    }
}
