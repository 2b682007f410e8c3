use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::AnyPool;

use crate::models::{Error, TenantId};
use crate::storage::row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    PerTenant,
    PerDomain,
    PerRecipientDomain,
    PerIp,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::PerTenant => "per_tenant",
            RateLimitScope::PerDomain => "per_domain",
            RateLimitScope::PerRecipientDomain => "per_recipient_domain",
            RateLimitScope::PerIp => "per_ip",
        }
    }
}

/// Truncates `now` to the start of its containing window, so repeated calls
/// within the same window address the same bucket row.
fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let window_secs = window.num_seconds().max(1);
    let epoch_secs = now.timestamp();
    let bucket_secs = epoch_secs - epoch_secs.rem_euclid(window_secs);
    DateTime::from_timestamp(bucket_secs, 0).unwrap_or(now)
}

#[derive(Debug, Clone)]
pub struct RateLimitRepository {
    pool: AnyPool,
}

impl RateLimitRepository {
    pub fn new(pool: AnyPool) -> Self {
        RateLimitRepository { pool }
    }

    /// Atomically increments the counter for `(tenant_id, scope, key)` in the
    /// window containing `now`, returning the post-increment count. The
    /// `scope/key` pair keys windows independently per domain/IP within a
    /// scope (e.g. `per_domain` buckets are further keyed by the domain
    /// name, carried in `key`).
    pub async fn increment(
        &self,
        tenant_id: TenantId,
        scope: RateLimitScope,
        key: &str,
        window: Duration,
    ) -> Result<i64, Error> {
        let bucket_start = window_start(Utc::now(), window).to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO rate_limit_buckets (tenant_id, scope, bucket_key, window_start, count)
            VALUES (?, ?, ?, ?, 1)
            ON CONFLICT (tenant_id, scope, bucket_key, window_start) DO UPDATE SET
                count = rate_limit_buckets.count + 1
            "#,
        )
        .bind(tenant_id.to_string())
        .bind(scope.as_str())
        .bind(key)
        .bind(&bucket_start)
        .execute(&self.pool)
        .await?;

        let row_ = sqlx::query(
            "SELECT count FROM rate_limit_buckets WHERE tenant_id = ? AND scope = ? AND bucket_key = ? AND window_start = ?",
        )
        .bind(tenant_id.to_string())
        .bind(scope.as_str())
        .bind(key)
        .bind(&bucket_start)
        .fetch_one(&self.pool)
        .await?;

        Ok(sqlx::Row::try_get(&row_, "count")?)
    }

    /// Deletes bucket rows whose window has fully elapsed, keeping the table
    /// small. Run periodically alongside quota resets.
    pub async fn sweep_expired(&self, older_than: Duration) -> Result<u64, Error> {
        let cutoff = (Utc::now() - older_than).to_rfc3339();
        let result = sqlx::query("DELETE FROM rate_limit_buckets WHERE window_start < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

pub fn now_rfc3339() -> String {
    row::now_rfc3339()
}

#[cfg(test)]
mod test {
    use super::*;

    async fn memory_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn increments_within_same_window() {
        let pool = memory_pool().await;
        let repo = RateLimitRepository::new(pool);
        let tenant_id = TenantId::new();

        let first = repo
            .increment(tenant_id, RateLimitScope::PerTenant, "send", Duration::minutes(1))
            .await
            .unwrap();
        let second = repo
            .increment(tenant_id, RateLimitScope::PerTenant, "send", Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let pool = memory_pool().await;
        let repo = RateLimitRepository::new(pool);
        let tenant_id = TenantId::new();

        repo.increment(tenant_id, RateLimitScope::PerTenant, "send", Duration::minutes(1)).await.unwrap();
        let domain_count = repo
            .increment(tenant_id, RateLimitScope::PerDomain, "t1.com", Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(domain_count, 1);
    }
}
