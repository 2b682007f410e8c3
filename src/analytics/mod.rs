//! Analytics service layer: records pipeline events, fans
//! them out to matching webhook subscriptions, and prunes the raw event
//! log past the retention window. The roll-up query itself lives on
//! `models::AnalyticsRepository`; this module is the intake+retention
//! wrapper around it plus the one place that also triggers webhook fanout,
//! since every webhook delivery originates from an analytics event.

use chrono::{DateTime, Duration, Utc};

use crate::models::{AnalyticsRepository, DomainId, EmailId, Error, EventType, RollupBucket, RollupCount, TenantId};
use crate::webhook::WebhookFanout;

#[derive(Clone)]
pub struct Analytics {
    events: AnalyticsRepository,
    webhooks: WebhookFanout,
    retention: Duration,
}

impl Analytics {
    pub fn new(events: AnalyticsRepository, webhooks: WebhookFanout, retention_days: i64) -> Self {
        Analytics { events, webhooks, retention: Duration::days(retention_days) }
    }

    /// Records a pipeline event and, if it has a webhook-facing counterpart,
    /// enqueues deliveries for every matching subscription. `data` becomes
    /// the event's public JSON payload (both the stored metadata and the
    /// webhook body's `data` field).
    pub async fn record(
        &self,
        tenant_id: TenantId,
        domain_id: Option<DomainId>,
        email_id: Option<EmailId>,
        event_type: EventType,
        data: serde_json::Value,
    ) -> Result<(), Error> {
        let event = self.events.record(tenant_id, domain_id, email_id, event_type, data.clone()).await?;
        self.webhooks.enqueue_for_event(&event, data).await
    }

    pub async fn overview(&self, tenant_id: TenantId, bucket: RollupBucket, since: DateTime<Utc>) -> Result<Vec<RollupCount>, Error> {
        self.events.rollup(tenant_id, bucket, since).await
    }

    /// Deletes raw events past the retention window. Run by the periodic
    /// task; a real archival step (e.g. dumping to object storage before
    /// deletion) is left to deployment tooling, consistent with "deployment
    /// scripts" being out of scope.
    pub async fn prune_expired(&self) -> Result<u64, Error> {
        self.events.prune_older_than(self.retention).await
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{NewTenant, Plan, TenantRepository, WebhookRepository};

    async fn memory_pool() -> sqlx::AnyPool {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn record_enqueues_matching_webhook() {
        let pool = memory_pool().await;
        let tenant = TenantRepository::new(pool.clone())
            .create(NewTenant { name: "Acme".into(), plan: Plan::Free })
            .await
            .unwrap();

        let webhooks_repo = WebhookRepository::new(pool.clone());
        webhooks_repo
            .create(
                tenant.id,
                crate::models::NewWebhookSubscription {
                    url: "https://example.net/hook".into(),
                    events: std::collections::BTreeSet::from([crate::models::WebhookEvent::Sent]),
                },
            )
            .await
            .unwrap();

        let analytics = Analytics::new(
            AnalyticsRepository::new(pool.clone()),
            WebhookFanout::new(webhooks_repo.clone()),
            30,
        );

        analytics.record(tenant.id, None, None, EventType::Sent, serde_json::json!({"id": "em_1"})).await.unwrap();

        let due = webhooks_repo.due_deliveries(10).await.unwrap();
        assert_eq!(due.len(), 1);
    }
}
