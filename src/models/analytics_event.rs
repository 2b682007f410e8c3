use chrono::{DateTime, Timelike, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, AnyPool, Row};
use uuid::Uuid;

use crate::models::{DomainId, EmailId, Error, TenantId};
use crate::storage::row;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr)]
pub struct AnalyticsEventId(Uuid);

impl AnalyticsEventId {
    pub fn new() -> Self {
        AnalyticsEventId(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Queued,
    Sent,
    Delivered,
    Deferred,
    Bounced,
    Complained,
    Opened,
    Clicked,
    Unsubscribed,
    Rejected,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Queued => "queued",
            EventType::Sent => "sent",
            EventType::Delivered => "delivered",
            EventType::Deferred => "deferred",
            EventType::Bounced => "bounced",
            EventType::Complained => "complained",
            EventType::Opened => "opened",
            EventType::Clicked => "clicked",
            EventType::Unsubscribed => "unsubscribed",
            EventType::Rejected => "rejected",
        }
    }

    fn parse(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "queued" => EventType::Queued,
            "sent" => EventType::Sent,
            "delivered" => EventType::Delivered,
            "deferred" => EventType::Deferred,
            "bounced" => EventType::Bounced,
            "complained" => EventType::Complained,
            "opened" => EventType::Opened,
            "clicked" => EventType::Clicked,
            "unsubscribed" => EventType::Unsubscribed,
            "rejected" => EventType::Rejected,
            other => return Err(Error::Internal(format!("unknown event type {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupBucket {
    Hour,
    Day,
}

impl RollupBucket {
    fn as_str(&self) -> &'static str {
        match self {
            RollupBucket::Hour => "hour",
            RollupBucket::Day => "day",
        }
    }

    /// Truncates `at` to the start of the bucket it falls in.
    fn truncate(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            RollupBucket::Hour => at
                .date_naive()
                .and_hms_opt(at.time().hour(), 0, 0)
                .unwrap()
                .and_utc(),
            RollupBucket::Day => at.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsEvent {
    pub id: AnalyticsEventId,
    pub tenant_id: TenantId,
    pub domain_id: Option<DomainId>,
    pub email_id: Option<EmailId>,
    pub event_type: EventType,
    pub occurred_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollupCount {
    pub bucket: RollupBucket,
    pub bucket_start: DateTime<Utc>,
    pub domain_id: Option<DomainId>,
    pub event_type: EventType,
    pub count: i64,
}

fn event_from_row(row_: &AnyRow) -> Result<AnalyticsEvent, Error> {
    Ok(AnalyticsEvent {
        id: row::uuid(row_, "id")?.into(),
        tenant_id: row::uuid(row_, "tenant_id")?.into(),
        domain_id: row::uuid_opt(row_, "domain_id")?.map(Into::into),
        email_id: row::uuid_opt(row_, "email_id")?.map(Into::into),
        event_type: EventType::parse(&row_.try_get::<String, _>("event_type")?)?,
        occurred_at: row::datetime(row_, "occurred_at")?,
        metadata: row::json(row_, "metadata")?,
    })
}

#[derive(Debug, Clone)]
pub struct AnalyticsRepository {
    pool: AnyPool,
}

impl AnalyticsRepository {
    pub fn new(pool: AnyPool) -> Self {
        AnalyticsRepository { pool }
    }

    pub async fn record(
        &self,
        tenant_id: TenantId,
        domain_id: Option<DomainId>,
        email_id: Option<EmailId>,
        event_type: EventType,
        metadata: serde_json::Value,
    ) -> Result<AnalyticsEvent, Error> {
        let id = AnalyticsEventId::new();
        let now = row::now_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO analytics_events (id, tenant_id, domain_id, email_id, event_type, occurred_at, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .bind(domain_id.map(|d| d.to_string()))
        .bind(email_id.map(|e| e.to_string()))
        .bind(event_type.as_str())
        .bind(&now)
        .bind(serde_json::to_string(&metadata)?)
        .execute(&self.pool)
        .await?;

        let row_ = sqlx::query("SELECT * FROM analytics_events WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        event_from_row(&row_)
    }

    /// Ad-hoc roll-up computed at query time over the raw event log. Real
    /// deployments would materialise this incrementally (see
    /// `analytics::rollup`), but querying the log directly is O(events in
    /// window), which is fine for the default 30-day retention window and
    /// keeps this repository free of background-job coupling.
    pub async fn rollup(
        &self,
        tenant_id: TenantId,
        bucket: RollupBucket,
        since: DateTime<Utc>,
    ) -> Result<Vec<RollupCount>, Error> {
        let since_str = since.to_rfc3339();
        let rows = sqlx::query(
            "SELECT domain_id, event_type, occurred_at FROM analytics_events WHERE tenant_id = ? AND occurred_at >= ?",
        )
        .bind(tenant_id.to_string())
        .bind(&since_str)
        .fetch_all(&self.pool)
        .await?;

        use std::collections::BTreeMap;
        let mut counts: BTreeMap<(Option<Uuid>, &'static str, DateTime<Utc>), i64> = BTreeMap::new();

        for row_ in &rows {
            let domain_id: Option<String> = row_.try_get("domain_id")?;
            let domain_id = domain_id
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .map_err(|e| Error::Internal(format!("invalid uuid in domain_id: {e}")))?;
            let event_type = EventType::parse(&row_.try_get::<String, _>("event_type")?)?;
            let occurred_at = row::datetime(row_, "occurred_at")?;
            let bucket_start = bucket.truncate(occurred_at);

            *counts.entry((domain_id, event_type.as_str(), bucket_start)).or_insert(0) += 1;
        }

        Ok(counts
            .into_iter()
            .map(|((domain_id, event_type, bucket_start), count)| RollupCount {
                bucket,
                bucket_start,
                domain_id: domain_id.map(Into::into),
                event_type: EventType::parse(event_type).expect("round-trips through as_str"),
                count,
            })
            .collect())
    }

    /// Deletes raw events older than the retention window.
    pub async fn prune_older_than(&self, retention: chrono::Duration) -> Result<u64, Error> {
        let cutoff = (Utc::now() - retention).to_rfc3339();
        let result = sqlx::query("DELETE FROM analytics_events WHERE occurred_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
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
    async fn record_and_rollup() {
        let pool = memory_pool().await;
        let tenant = TenantRepository::new(pool.clone())
            .create(NewTenant { name: "Acme".into(), plan: Plan::Free })
            .await
            .unwrap();
        let repo = AnalyticsRepository::new(pool);

        repo.record(tenant.id, None, None, EventType::Sent, serde_json::json!({})).await.unwrap();
        repo.record(tenant.id, None, None, EventType::Sent, serde_json::json!({})).await.unwrap();
        repo.record(tenant.id, None, None, EventType::Bounced, serde_json::json!({})).await.unwrap();

        let rollup = repo
            .rollup(tenant.id, RollupBucket::Day, Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();

        let sent_count: i64 = rollup.iter().filter(|r| r.event_type == EventType::Sent).map(|r| r.count).sum();
        assert_eq!(sent_count, 2);
    }
}
