//! Durable, tenant-namespaced work queue backing the `validated → queued`
//! and retry-scheduling steps of the pipeline.
//!
//! Each row in `queue_items` carries an opaque JSON `payload`; the queue
//! itself doesn't know about emails or delivery attempts, only about a
//! `(queue_name, run_at)` ordering and a dead-letter threshold. The
//! pipeline and bounce classifier interpret the payload.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{any::AnyRow, AnyPool, Row};
use uuid::Uuid;

use crate::models::{Error, TenantId};
use crate::storage::row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Leased,
    DeadLetter,
}

impl ItemState {
    fn as_str(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::Leased => "leased",
            ItemState::DeadLetter => "dead_letter",
        }
    }

    fn parse(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "pending" => ItemState::Pending,
            "leased" => ItemState::Leased,
            "dead_letter" => ItemState::DeadLetter,
            other => return Err(Error::Internal(format!("unknown queue item state {other}"))),
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub queue_name: String,
    pub state: ItemState,
    pub run_at: DateTime<Utc>,
    pub attempts: i64,
    pub dead_letter_after: i64,
    pub locked_by: Option<String>,
}

fn item_from_row(row_: &AnyRow) -> Result<QueueItem, Error> {
    Ok(QueueItem {
        id: row::uuid(row_, "id")?,
        tenant_id: row::uuid(row_, "tenant_id")?.into(),
        queue_name: row_.try_get("queue_name")?,
        state: ItemState::parse(&row_.try_get::<String, _>("state")?)?,
        run_at: row::datetime(row_, "run_at")?,
        attempts: row_.try_get("attempts")?,
        dead_letter_after: row_.try_get("dead_letter_after")?,
        locked_by: row_.try_get("locked_by")?,
    })
}

#[derive(Debug, Clone)]
pub struct Queue {
    pool: AnyPool,
}

impl Queue {
    pub fn new(pool: AnyPool) -> Self {
        Queue { pool }
    }

    /// Enqueues `payload` for immediate or delayed processing. `run_at`
    /// defaults to now when `None`.
    pub async fn push<T: Serialize>(
        &self,
        tenant_id: TenantId,
        queue_name: &str,
        payload: &T,
        run_at: Option<DateTime<Utc>>,
        dead_letter_after: i64,
    ) -> Result<Uuid, Error> {
        let id = Uuid::new_v4();
        let now = row::now_rfc3339();
        let run_at = run_at.map(|dt| dt.to_rfc3339()).unwrap_or_else(|| now.clone());

        sqlx::query(
            r#"
            INSERT INTO queue_items (
                id, tenant_id, queue_name, payload, state, run_at, attempts,
                dead_letter_after, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, 'pending', ?, 0, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .bind(queue_name)
        .bind(serde_json::to_string(payload)?)
        .bind(&run_at)
        .bind(dead_letter_after)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Leases the oldest due, unlocked item in `queue_name` for `worker_id`,
    /// scoped to `tenant_id` so a worker can never dequeue another tenant's
    /// work — the `(tenant_id, queue_name, state, run_at)` index exists for
    /// exactly this lookup. Atomically marks the row `leased` so a
    /// concurrent worker can't also claim it. Uses a conditional `UPDATE`
    /// rather than `SELECT ... FOR UPDATE SKIP LOCKED` since the `sqlx::Any`
    /// backend must behave identically against SQLite, which has no
    /// row-level locking.
    pub async fn lease<T: DeserializeOwned>(
        &self,
        tenant_id: TenantId,
        queue_name: &str,
        worker_id: &str,
    ) -> Result<Option<(QueueItem, T)>, Error> {
        let now = row::now_rfc3339();

        let candidate = sqlx::query(
            "SELECT id FROM queue_items WHERE tenant_id = ? AND queue_name = ? AND state = 'pending' AND run_at <= ? ORDER BY run_at LIMIT 1",
        )
        .bind(tenant_id.to_string())
        .bind(queue_name)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(candidate) = candidate else { return Ok(None) };
        let candidate_id: String = candidate.try_get("id")?;

        let result = sqlx::query(
            "UPDATE queue_items SET state = 'leased', locked_by = ?, locked_at = ?, updated_at = ? WHERE id = ? AND state = 'pending' AND tenant_id = ?",
        )
        .bind(worker_id)
        .bind(&now)
        .bind(&now)
        .bind(&candidate_id)
        .bind(tenant_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Lost the race to another worker; caller should retry.
            return Ok(None);
        }

        let row_ = sqlx::query("SELECT * FROM queue_items WHERE id = ?")
            .bind(&candidate_id)
            .fetch_one(&self.pool)
            .await?;

        let item = item_from_row(&row_)?;
        let payload: T = row::json(&row_, "payload")?;
        Ok(Some((item, payload)))
    }

    pub async fn complete(&self, id: Uuid) -> Result<(), Error> {
        sqlx::query("DELETE FROM queue_items WHERE id = ?").bind(id.to_string()).execute(&self.pool).await?;
        Ok(())
    }

    /// Releases a leased item back to `pending`, rescheduling it for
    /// `run_at` and incrementing `attempts`. Moves to `dead_letter` instead
    /// once `attempts` would exceed `dead_letter_after`.
    pub async fn release(&self, id: Uuid, run_at: DateTime<Utc>) -> Result<ItemState, Error> {
        let now = row::now_rfc3339();

        let row_ = sqlx::query("SELECT attempts, dead_letter_after FROM queue_items WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        let attempts: i64 = row_.try_get("attempts")?;
        let dead_letter_after: i64 = row_.try_get("dead_letter_after")?;
        let next_attempts = attempts + 1;

        let state = if next_attempts >= dead_letter_after { ItemState::DeadLetter } else { ItemState::Pending };

        sqlx::query(
            "UPDATE queue_items SET state = ?, attempts = ?, run_at = ?, locked_by = NULL, locked_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(next_attempts)
        .bind(run_at.to_rfc3339())
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(state)
    }

    pub async fn dead_letters(&self, tenant_id: TenantId, queue_name: &str) -> Result<Vec<QueueItem>, Error> {
        let rows = sqlx::query(
            "SELECT * FROM queue_items WHERE tenant_id = ? AND queue_name = ? AND state = 'dead_letter' ORDER BY updated_at DESC",
        )
        .bind(tenant_id.to_string())
        .bind(queue_name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Reclaims items that have been `leased` for longer than `stale_after`
    /// without completing, in case their worker crashed mid-delivery.
    pub async fn reclaim_stale(&self, stale_after: chrono::Duration) -> Result<u64, Error> {
        let cutoff = (Utc::now() - stale_after).to_rfc3339();
        let result = sqlx::query("UPDATE queue_items SET state = 'pending', locked_by = NULL WHERE state = 'leased' AND locked_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        email_id: Uuid,
    }

    async fn memory_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn seed_tenant(pool: &AnyPool) -> TenantId {
        crate::models::TenantRepository::new(pool.clone())
            .create(crate::models::NewTenant { name: "Acme".into(), plan: crate::models::Plan::Free })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn push_lease_complete_round_trip() {
        let pool = memory_pool().await;
        let tenant_id = seed_tenant(&pool).await;
        let queue = Queue::new(pool);

        let email_id = Uuid::new_v4();
        queue.push(tenant_id, "delivery", &Payload { email_id }, None, 5).await.unwrap();

        let (item, payload): (QueueItem, Payload) = queue.lease(tenant_id, "delivery", "worker-1").await.unwrap().unwrap();
        assert_eq!(payload.email_id, email_id);
        assert_eq!(item.state, ItemState::Leased);

        assert!(queue.lease::<Payload>(tenant_id, "delivery", "worker-2").await.unwrap().is_none());

        queue.complete(item.id).await.unwrap();
        assert!(queue.lease::<Payload>(tenant_id, "delivery", "worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_moves_to_dead_letter_after_threshold() {
        let pool = memory_pool().await;
        let tenant_id = seed_tenant(&pool).await;
        let queue = Queue::new(pool);

        let id = queue.push(tenant_id, "delivery", &Payload { email_id: Uuid::new_v4() }, None, 2).await.unwrap();

        let (item, _): (QueueItem, Payload) = queue.lease(tenant_id, "delivery", "worker-1").await.unwrap().unwrap();
        assert_eq!(item.id, id);

        let state = queue.release(item.id, Utc::now()).await.unwrap();
        assert_eq!(state, ItemState::Pending);

        let (item, _): (QueueItem, Payload) = queue.lease(tenant_id, "delivery", "worker-1").await.unwrap().unwrap();
        let state = queue.release(item.id, Utc::now()).await.unwrap();
        assert_eq!(state, ItemState::DeadLetter);

        let dead = queue.dead_letters(tenant_id, "delivery").await.unwrap();
        assert_eq!(dead.len(), 1);
    }

    #[tokio::test]
    async fn lease_never_returns_another_tenants_item() {
        let pool = memory_pool().await;
        let tenant_a = seed_tenant(&pool).await;
        let tenant_b = seed_tenant(&pool).await;
        let queue = Queue::new(pool);

        queue.push(tenant_a, "delivery", &Payload { email_id: Uuid::new_v4() }, None, 5).await.unwrap();

        assert!(queue.lease::<Payload>(tenant_b, "delivery", "worker-1").await.unwrap().is_none());

        let (item, _): (QueueItem, Payload) = queue.lease(tenant_a, "delivery", "worker-1").await.unwrap().unwrap();
        assert_eq!(item.tenant_id, tenant_a);
    }
}
