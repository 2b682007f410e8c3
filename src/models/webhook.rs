use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, AnyPool, Row};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::models::{Error, TenantId};
use crate::storage::row;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr)]
pub struct WebhookSubscriptionId(Uuid);

impl WebhookSubscriptionId {
    pub fn new() -> Self {
        WebhookSubscriptionId(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr)]
pub struct WebhookDeliveryId(Uuid);

impl WebhookDeliveryId {
    pub fn new() -> Self {
        WebhookDeliveryId(Uuid::new_v4())
    }
}

/// Mirrors `analytics_event::EventType`; kept as its own enum since a
/// subscription's event set is a narrower, user-facing vocabulary than the
/// full internal analytics taxonomy (e.g. no `rejected`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
    Queued,
    Sent,
    Delivered,
    Deferred,
    Bounced,
    Complained,
    Opened,
    Clicked,
    Unsubscribed,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::Queued => "queued",
            WebhookEvent::Sent => "sent",
            WebhookEvent::Delivered => "delivered",
            WebhookEvent::Deferred => "deferred",
            WebhookEvent::Bounced => "bounced",
            WebhookEvent::Complained => "complained",
            WebhookEvent::Opened => "opened",
            WebhookEvent::Clicked => "clicked",
            WebhookEvent::Unsubscribed => "unsubscribed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => WebhookEvent::Queued,
            "sent" => WebhookEvent::Sent,
            "delivered" => WebhookEvent::Delivered,
            "deferred" => WebhookEvent::Deferred,
            "bounced" => WebhookEvent::Bounced,
            "complained" => WebhookEvent::Complained,
            "opened" => WebhookEvent::Opened,
            "clicked" => WebhookEvent::Clicked,
            "unsubscribed" => WebhookEvent::Unsubscribed,
            _ => return None,
        })
    }
}

fn encode_events(events: &BTreeSet<WebhookEvent>) -> String {
    events.iter().map(WebhookEvent::as_str).collect::<Vec<_>>().join(",")
}

fn decode_events(raw: &str) -> BTreeSet<WebhookEvent> {
    raw.split(',').filter_map(WebhookEvent::parse).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookSubscription {
    pub id: WebhookSubscriptionId,
    pub tenant_id: TenantId,
    pub url: String,
    pub events: BTreeSet<WebhookEvent>,
    #[serde(skip)]
    pub secret: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct NewWebhookSubscription {
    pub url: String,
    pub events: BTreeSet<WebhookEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryFinalStatus {
    Pending,
    Delivered,
    FailedPermanent,
}

impl DeliveryFinalStatus {
    fn as_str(&self) -> &'static str {
        match self {
            DeliveryFinalStatus::Pending => "pending",
            DeliveryFinalStatus::Delivered => "delivered",
            DeliveryFinalStatus::FailedPermanent => "failed_permanent",
        }
    }

    fn parse(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "pending" => DeliveryFinalStatus::Pending,
            "delivered" => DeliveryFinalStatus::Delivered,
            "failed_permanent" => DeliveryFinalStatus::FailedPermanent,
            other => return Err(Error::Internal(format!("unknown webhook delivery status {other}"))),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookDelivery {
    pub id: WebhookDeliveryId,
    pub subscription_id: WebhookSubscriptionId,
    pub event: WebhookEvent,
    pub payload: serde_json::Value,
    pub attempts: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub final_status: DeliveryFinalStatus,
    pub created_at: DateTime<Utc>,
}

fn subscription_from_row(row_: &AnyRow) -> Result<WebhookSubscription, Error> {
    Ok(WebhookSubscription {
        id: row::uuid(row_, "id")?.into(),
        tenant_id: row::uuid(row_, "tenant_id")?.into(),
        url: row_.try_get("url")?,
        events: decode_events(&row_.try_get::<String, _>("events")?),
        secret: row_.try_get("secret")?,
        active: row_.try_get::<i64, _>("active")? != 0,
        created_at: row::datetime(row_, "created_at")?,
    })
}

fn delivery_from_row(row_: &AnyRow) -> Result<WebhookDelivery, Error> {
    Ok(WebhookDelivery {
        id: row::uuid(row_, "id")?.into(),
        subscription_id: row::uuid(row_, "subscription_id")?.into(),
        event: WebhookEvent::parse(&row_.try_get::<String, _>("event")?)
            .ok_or(Error::Internal("unknown webhook event in storage".into()))?,
        payload: row::json(row_, "payload")?,
        attempts: row_.try_get("attempts")?,
        next_retry_at: row::datetime_opt(row_, "next_retry_at")?,
        final_status: DeliveryFinalStatus::parse(&row_.try_get::<String, _>("final_status")?)?,
        created_at: row::datetime(row_, "created_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct WebhookRepository {
    pool: AnyPool,
}

impl WebhookRepository {
    pub fn new(pool: AnyPool) -> Self {
        WebhookRepository { pool }
    }

    pub async fn create(&self, tenant_id: TenantId, new: NewWebhookSubscription) -> Result<WebhookSubscription, Error> {
        let id = WebhookSubscriptionId::new();
        let secret = Alphanumeric.sample_string(&mut rand::rng(), 40);
        let now = row::now_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO webhook_subscriptions (id, tenant_id, url, events, secret, active, created_at)
            VALUES (?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .bind(&new.url)
        .bind(encode_events(&new.events))
        .bind(&secret)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(tenant_id, id).await?.ok_or(Error::NotFound("webhook subscription not found after insert"))
    }

    pub async fn get(&self, tenant_id: TenantId, id: WebhookSubscriptionId) -> Result<Option<WebhookSubscription>, Error> {
        let row_ = sqlx::query("SELECT * FROM webhook_subscriptions WHERE id = ? AND tenant_id = ?")
            .bind(id.to_string())
            .bind(tenant_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row_.as_ref().map(subscription_from_row).transpose()
    }

    pub async fn list(&self, tenant_id: TenantId) -> Result<Vec<WebhookSubscription>, Error> {
        let rows = sqlx::query("SELECT * FROM webhook_subscriptions WHERE tenant_id = ? ORDER BY created_at")
            .bind(tenant_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(subscription_from_row).collect()
    }

    /// Subscriptions across all tenants matching `event` — used by the
    /// fanout stage, which dispatches per-tenant analytics events to every
    /// subscription that tenant owns for that event type.
    pub async fn active_for_tenant_and_event(
        &self,
        tenant_id: TenantId,
        event: WebhookEvent,
    ) -> Result<Vec<WebhookSubscription>, Error> {
        let rows = sqlx::query("SELECT * FROM webhook_subscriptions WHERE tenant_id = ? AND active = 1")
            .bind(tenant_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(subscription_from_row)
            .filter(|s| s.as_ref().map(|s| s.events.contains(&event)).unwrap_or(true))
            .collect()
    }

    /// Looks a subscription up by id alone, with no tenant filter. Used by
    /// the webhook fanout service when resolving the subscription behind an
    /// already-enqueued delivery, where the id is an opaque internal
    /// foreign key never accepted from tenant-facing input.
    pub async fn get_by_subscription_id(&self, id: WebhookSubscriptionId) -> Result<Option<WebhookSubscription>, Error> {
        let row_ = sqlx::query("SELECT * FROM webhook_subscriptions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row_.as_ref().map(subscription_from_row).transpose()
    }

    pub async fn remove(&self, tenant_id: TenantId, id: WebhookSubscriptionId) -> Result<(), Error> {
        let result = sqlx::query("DELETE FROM webhook_subscriptions WHERE id = ? AND tenant_id = ?")
            .bind(id.to_string())
            .bind(tenant_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("webhook subscription not found"));
        }
        Ok(())
    }

    pub async fn enqueue_delivery(
        &self,
        subscription_id: WebhookSubscriptionId,
        event: WebhookEvent,
        payload: serde_json::Value,
    ) -> Result<WebhookDelivery, Error> {
        let id = WebhookDeliveryId::new();
        let now = row::now_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (id, subscription_id, event, payload, attempts, final_status, created_at)
            VALUES (?, ?, ?, ?, 0, 'pending', ?)
            "#,
        )
        .bind(id.to_string())
        .bind(subscription_id.to_string())
        .bind(event.as_str())
        .bind(serde_json::to_string(&payload)?)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let row_ = sqlx::query("SELECT * FROM webhook_deliveries WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        delivery_from_row(&row_)
    }

    pub async fn due_deliveries(&self, limit: i64) -> Result<Vec<WebhookDelivery>, Error> {
        let now = row::now_rfc3339();
        let rows = sqlx::query(
            r#"
            SELECT * FROM webhook_deliveries
            WHERE final_status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?)
            ORDER BY created_at
            LIMIT ?
            "#,
        )
        .bind(&now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delivery_from_row).collect()
    }

    pub async fn mark_delivered(&self, id: WebhookDeliveryId) -> Result<(), Error> {
        sqlx::query("UPDATE webhook_deliveries SET final_status = 'delivered', attempts = attempts + 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_retry(&self, id: WebhookDeliveryId, next_retry_at: DateTime<Utc>) -> Result<(), Error> {
        sqlx::query("UPDATE webhook_deliveries SET attempts = attempts + 1, next_retry_at = ? WHERE id = ?")
            .bind(next_retry_at.to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failed_permanent(&self, id: WebhookDeliveryId) -> Result<(), Error> {
        sqlx::query("UPDATE webhook_deliveries SET final_status = 'failed_permanent', attempts = attempts + 1 WHERE id = ?")
            .bind(id.to_string())
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
    async fn subscription_and_delivery_flow() {
        let pool = memory_pool().await;
        let tenant = TenantRepository::new(pool.clone())
            .create(NewTenant { name: "Acme".into(), plan: Plan::Free })
            .await
            .unwrap();

        let repo = WebhookRepository::new(pool);
        let sub = repo
            .create(tenant.id, NewWebhookSubscription {
                url: "https://example.net/hook".into(),
                events: BTreeSet::from([WebhookEvent::Sent, WebhookEvent::Bounced]),
            })
            .await
            .unwrap();

        let matches = repo.active_for_tenant_and_event(tenant.id, WebhookEvent::Sent).await.unwrap();
        assert_eq!(matches.len(), 1);

        let delivery = repo
            .enqueue_delivery(sub.id, WebhookEvent::Sent, serde_json::json!({"id": "em_1"}))
            .await
            .unwrap();
        assert_eq!(delivery.final_status, DeliveryFinalStatus::Pending);

        let due = repo.due_deliveries(10).await.unwrap();
        assert_eq!(due.len(), 1);

        repo.mark_delivered(delivery.id).await.unwrap();
        assert!(repo.due_deliveries(10).await.unwrap().is_empty());
    }
}
