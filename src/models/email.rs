use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, AnyPool, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::models::{Error, TenantId};
use crate::storage::row;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr)]
pub struct EmailId(Uuid);

impl EmailId {
    pub fn new() -> Self {
        EmailId(Uuid::new_v4())
    }
}

impl Default for EmailId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr)]
pub struct DeliveryAttemptId(Uuid);

impl DeliveryAttemptId {
    pub fn new() -> Self {
        DeliveryAttemptId(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }

    fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "outbound" => Ok(Direction::Outbound),
            "inbound" => Ok(Direction::Inbound),
            other => Err(Error::Internal(format!("unknown direction {other}"))),
        }
    }
}

/// The pipeline's state machine. Transitions are one-way;
/// `queue::Queue` and `pipeline::Pipeline` are the only callers allowed to
/// advance an email's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailState {
    Received,
    Validated,
    Queued,
    Signing,
    Sending,
    Sent,
    Deferred,
    Bounced,
    Failed,
    Suppressed,
}

impl EmailState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EmailState::Sent | EmailState::Bounced | EmailState::Failed | EmailState::Suppressed
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            EmailState::Received => "received",
            EmailState::Validated => "validated",
            EmailState::Queued => "queued",
            EmailState::Signing => "signing",
            EmailState::Sending => "sending",
            EmailState::Sent => "sent",
            EmailState::Deferred => "deferred",
            EmailState::Bounced => "bounced",
            EmailState::Failed => "failed",
            EmailState::Suppressed => "suppressed",
        }
    }

    fn parse(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "received" => EmailState::Received,
            "validated" => EmailState::Validated,
            "queued" => EmailState::Queued,
            "signing" => EmailState::Signing,
            "sending" => EmailState::Sending,
            "sent" => EmailState::Sent,
            "deferred" => EmailState::Deferred,
            "bounced" => EmailState::Bounced,
            "failed" => EmailState::Failed,
            "suppressed" => EmailState::Suppressed,
            other => return Err(Error::Internal(format!("unknown email state {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptClassification {
    Success,
    Transient,
    Permanent,
    Deferred,
    TlsFail,
}

impl AttemptClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptClassification::Success => "success",
            AttemptClassification::Transient => "transient",
            AttemptClassification::Permanent => "permanent",
            AttemptClassification::Deferred => "deferred",
            AttemptClassification::TlsFail => "tls_fail",
        }
    }

    fn parse(s: &str) -> Result<Self, Error> {
        Ok(match s {
            "success" => AttemptClassification::Success,
            "transient" => AttemptClassification::Transient,
            "permanent" => AttemptClassification::Permanent,
            "deferred" => AttemptClassification::Deferred,
            "tls_fail" => AttemptClassification::TlsFail,
            other => return Err(Error::Internal(format!("unknown classification {other}"))),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tracking {
    #[serde(default)]
    pub opens: bool,
    #[serde(default)]
    pub clicks: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Email {
    pub id: EmailId,
    pub tenant_id: TenantId,
    pub message_id: String,
    pub direction: Direction,
    pub envelope_from: String,
    pub envelope_to: Vec<String>,
    pub headers: BTreeMap<String, String>,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub template_ref: Option<String>,
    pub state: EmailState,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub dkim_domain_used: Option<String>,
    pub fallback_used: bool,
    pub size_bytes: i64,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct NewEmail {
    pub from: String,
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub template: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    pub tracking: Option<Tracking>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl NewEmail {
    pub fn all_recipients(&self) -> Vec<String> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .cloned()
            .collect()
    }

    pub fn estimated_size_bytes(&self) -> i64 {
        let mut size = self.subject.len();
        size += self.html.as_deref().map_or(0, str::len);
        size += self.text.as_deref().map_or(0, str::len);
        size as i64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryAttempt {
    pub id: DeliveryAttemptId,
    pub email_id: EmailId,
    pub attempt_number: i64,
    pub mx_host: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub smtp_response_code: Option<i32>,
    pub smtp_response_text: Option<String>,
    pub classification: AttemptClassification,
    pub next_retry_at: Option<DateTime<Utc>>,
}

fn email_from_row(row_: &AnyRow) -> Result<Email, Error> {
    Ok(Email {
        id: row::uuid(row_, "id")?.into(),
        tenant_id: row::uuid(row_, "tenant_id")?.into(),
        message_id: row_.try_get("message_id")?,
        direction: Direction::parse(&row_.try_get::<String, _>("direction")?)?,
        envelope_from: row_.try_get("envelope_from")?,
        envelope_to: row::json(row_, "envelope_to")?,
        headers: row::json(row_, "headers")?,
        body_html: row_.try_get("body_html")?,
        body_text: row_.try_get("body_text")?,
        template_ref: row_.try_get("template_ref")?,
        state: EmailState::parse(&row_.try_get::<String, _>("state")?)?,
        attempts: row_.try_get("attempts")?,
        last_error: row_.try_get("last_error")?,
        dkim_domain_used: row_.try_get("dkim_domain_used")?,
        fallback_used: row_.try_get::<i64, _>("fallback_used")? != 0,
        size_bytes: row_.try_get("size_bytes")?,
        idempotency_key: row_.try_get("idempotency_key")?,
        created_at: row::datetime(row_, "created_at")?,
        finalized_at: row::datetime_opt(row_, "finalized_at")?,
    })
}

fn attempt_from_row(row_: &AnyRow) -> Result<DeliveryAttempt, Error> {
    Ok(DeliveryAttempt {
        id: row::uuid(row_, "id")?.into(),
        email_id: row::uuid(row_, "email_id")?.into(),
        attempt_number: row_.try_get("attempt_number")?,
        mx_host: row_.try_get("mx_host")?,
        started_at: row::datetime(row_, "started_at")?,
        duration_ms: row_.try_get("duration_ms")?,
        smtp_response_code: row_.try_get("smtp_response_code")?,
        smtp_response_text: row_.try_get("smtp_response_text")?,
        classification: AttemptClassification::parse(&row_.try_get::<String, _>("classification")?)?,
        next_retry_at: row::datetime_opt(row_, "next_retry_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct EmailRepository {
    pool: AnyPool,
}

pub fn generate_message_id(hostname: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let rand_hex: String = {
        use rand::RngCore;
        let mut bytes = [0u8; 8];
        rand::rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    };
    format!("<{nanos}.{rand_hex}@{hostname}>")
}

impl EmailRepository {
    pub fn new(pool: AnyPool) -> Self {
        EmailRepository { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_received(
        &self,
        tenant_id: TenantId,
        message_id: String,
        direction: Direction,
        envelope_from: String,
        envelope_to: Vec<String>,
        headers: BTreeMap<String, String>,
        body_html: Option<String>,
        body_text: Option<String>,
        template_ref: Option<String>,
        size_bytes: i64,
        idempotency_key: Option<String>,
    ) -> Result<Email, Error> {
        let id = EmailId::new();
        let now = row::now_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO emails (
                id, tenant_id, message_id, direction, envelope_from, envelope_to, headers,
                body_html, body_text, template_ref, state, attempts, fallback_used, size_bytes,
                idempotency_key, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'received', 0, 0, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .bind(&message_id)
        .bind(direction.as_str())
        .bind(&envelope_from)
        .bind(serde_json::to_string(&envelope_to)?)
        .bind(serde_json::to_string(&headers)?)
        .bind(&body_html)
        .bind(&body_text)
        .bind(&template_ref)
        .bind(size_bytes)
        .bind(&idempotency_key)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(tenant_id, id).await?.ok_or(Error::NotFound("email not found after insert"))
    }

    pub async fn get(&self, tenant_id: TenantId, id: EmailId) -> Result<Option<Email>, Error> {
        let row_ = sqlx::query("SELECT * FROM emails WHERE id = ? AND tenant_id = ?")
            .bind(id.to_string())
            .bind(tenant_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row_.as_ref().map(email_from_row).transpose()
    }

    pub async fn find_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
        window: chrono::Duration,
    ) -> Result<Option<Email>, Error> {
        let cutoff = (Utc::now() - window).to_rfc3339();
        let row_ = sqlx::query(
            "SELECT * FROM emails WHERE tenant_id = ? AND idempotency_key = ? AND created_at >= ? ORDER BY created_at DESC",
        )
        .bind(tenant_id.to_string())
        .bind(key)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;
        row_.as_ref().map(email_from_row).transpose()
    }

    pub async fn list(&self, tenant_id: TenantId, limit: i64, offset: i64) -> Result<Vec<Email>, Error> {
        let rows = sqlx::query(
            "SELECT * FROM emails WHERE tenant_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(tenant_id.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(email_from_row).collect()
    }

    pub async fn transition(&self, id: EmailId, state: EmailState) -> Result<(), Error> {
        let now = row::now_rfc3339();
        let finalized_clause = state.is_terminal().then(|| now.clone());

        sqlx::query(
            r#"
            UPDATE emails
            SET state = ?, finalized_at = COALESCE(?, finalized_at)
            WHERE id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(finalized_clause)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_signing(&self, id: EmailId, dkim_domain_used: &str, fallback_used: bool) -> Result<(), Error> {
        sqlx::query(
            "UPDATE emails SET state = 'signing', dkim_domain_used = ?, fallback_used = ? WHERE id = ?",
        )
        .bind(dkim_domain_used)
        .bind(if fallback_used { 1 } else { 0 })
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_error(&self, id: EmailId, error: &str) -> Result<(), Error> {
        sqlx::query("UPDATE emails SET last_error = ? WHERE id = ?")
            .bind(error)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn increment_attempts(&self, id: EmailId) -> Result<i64, Error> {
        let row_ = sqlx::query("UPDATE emails SET attempts = attempts + 1 WHERE id = ? RETURNING attempts")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row_.try_get("attempts")?)
    }

    pub async fn record_attempt(
        &self,
        email_id: EmailId,
        attempt_number: i64,
        mx_host: Option<&str>,
        duration_ms: i64,
        smtp_response_code: Option<i32>,
        smtp_response_text: Option<&str>,
        classification: AttemptClassification,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<DeliveryAttempt, Error> {
        let id = DeliveryAttemptId::new();
        let now = row::now_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO delivery_attempts (
                id, email_id, attempt_number, mx_host, started_at, duration_ms,
                smtp_response_code, smtp_response_text, classification, next_retry_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(email_id.to_string())
        .bind(attempt_number)
        .bind(mx_host)
        .bind(&now)
        .bind(duration_ms)
        .bind(smtp_response_code)
        .bind(smtp_response_text)
        .bind(classification.as_str())
        .bind(next_retry_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        let row_ = sqlx::query("SELECT * FROM delivery_attempts WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        attempt_from_row(&row_)
    }

    pub async fn attempts_for(&self, email_id: EmailId) -> Result<Vec<DeliveryAttempt>, Error> {
        let rows = sqlx::query("SELECT * FROM delivery_attempts WHERE email_id = ? ORDER BY attempt_number")
            .bind(email_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(attempt_from_row).collect()
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
    async fn lifecycle_and_attempts() {
        let pool = memory_pool().await;
        let tenant = TenantRepository::new(pool.clone())
            .create(NewTenant { name: "Acme".into(), plan: Plan::Free })
            .await
            .unwrap();

        let repo = EmailRepository::new(pool);
        let email = repo
            .create_received(
                tenant.id,
                generate_message_id("mail.ultrazend.example"),
                Direction::Outbound,
                "alerts@t1.com".into(),
                vec!["ops@example.net".into()],
                BTreeMap::new(),
                Some("<p>hi</p>".into()),
                None,
                None,
                64,
                Some("req-1".into()),
            )
            .await
            .unwrap();

        assert_eq!(email.state, EmailState::Received);

        repo.transition(email.id, EmailState::Queued).await.unwrap();
        repo.record_signing(email.id, "t1.com", false).await.unwrap();
        let attempt_no = repo.increment_attempts(email.id).await.unwrap();
        assert_eq!(attempt_no, 1);

        repo.record_attempt(
            email.id,
            1,
            Some("mx1.example.net"),
            120,
            Some(250),
            Some("OK"),
            AttemptClassification::Success,
            None,
        )
        .await
        .unwrap();
        repo.transition(email.id, EmailState::Sent).await.unwrap();

        let refreshed = repo.get(tenant.id, email.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, EmailState::Sent);
        assert!(refreshed.finalized_at.is_some());
        assert_eq!(refreshed.dkim_domain_used.as_deref(), Some("t1.com"));

        let attempts = repo.attempts_for(email.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].classification, AttemptClassification::Success);
    }

    #[tokio::test]
    async fn idempotency_key_reuse() {
        let pool = memory_pool().await;
        let tenant = TenantRepository::new(pool.clone())
            .create(NewTenant { name: "Acme".into(), plan: Plan::Free })
            .await
            .unwrap();
        let repo = EmailRepository::new(pool);

        let first = repo
            .create_received(
                tenant.id,
                generate_message_id("mail.ultrazend.example"),
                Direction::Outbound,
                "alerts@t1.com".into(),
                vec!["ops@example.net".into()],
                BTreeMap::new(),
                Some("<p>hi</p>".into()),
                None,
                None,
                64,
                Some("dup-key".into()),
            )
            .await
            .unwrap();

        let found = repo
            .find_by_idempotency_key(tenant.id, "dup-key", chrono::Duration::hours(24))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, first.id);
    }
}
