//! Orchestrates the full email state machine: validation and
//! admission happen synchronously inside `submit`, everything from signing
//! onward happens inside `process_one`, called in a loop by a delivery
//! worker. This is where every other service module (`dkim`, `transport`,
//! `rate_limiter`, `queue`, `bounce`, `analytics`, `bus`) gets wired
//! together; no service module holds a pointer back here, they only publish
//! events onto the bus or get called directly.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use email_address::EmailAddress;
use mail_send::smtp;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::analytics::Analytics;
use crate::bounce;
use crate::bus::{Bus, BusMessage};
use crate::config::{Config, RetryConfig};
use crate::dkim::DkimEngine;
use crate::models::{
    generate_message_id, AttemptClassification, Direction, DomainId, DomainRepository, Email, EmailId,
    EmailRepository, EmailState, Error, EventType, NewEmail, SuppressionRepository, TenantId, TenantRepository,
    VerificationStatus,
};
use crate::queue::Queue;
use crate::rate_limiter::RateLimiter;
use crate::transport::{DeliveryOutcome, Transport};

const DELIVERY_QUEUE: &str = "delivery";
const MAX_RECIPIENTS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeliveryJob {
    email_id: EmailId,
}

enum Advance {
    Done,
    Retry(DateTime<Utc>),
}

#[derive(Clone)]
pub struct Pipeline {
    emails: EmailRepository,
    domains: DomainRepository,
    tenants: TenantRepository,
    suppression: SuppressionRepository,
    rate_limiter: RateLimiter,
    dkim: DkimEngine,
    transport: Transport,
    queue: Queue,
    analytics: Analytics,
    bus: Bus,
    fallback_domain_id: DomainId,
    hostname: String,
    max_message_bytes: usize,
    retry: RetryConfig,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        emails: EmailRepository,
        domains: DomainRepository,
        tenants: TenantRepository,
        suppression: SuppressionRepository,
        rate_limiter: RateLimiter,
        dkim: DkimEngine,
        transport: Transport,
        queue: Queue,
        analytics: Analytics,
        bus: Bus,
        fallback_domain_id: DomainId,
        config: &Config,
    ) -> Self {
        Pipeline {
            emails,
            domains,
            tenants,
            suppression,
            rate_limiter,
            dkim,
            transport,
            queue,
            analytics,
            bus,
            fallback_domain_id,
            hostname: config.hostname.clone(),
            max_message_bytes: config.max_message_bytes,
            retry: config.retry.clone(),
        }
    }

    /// `received → validated → queued`. Runs
    /// synchronously inside the API request handler so a caller gets an
    /// immediate rejection code rather than discovering a failure later.
    pub async fn submit(
        &self,
        tenant_id: TenantId,
        new: NewEmail,
        source_ip: IpAddr,
        idempotency_key: Option<String>,
    ) -> Result<Email, Error> {
        let sender: EmailAddress = new.from.parse()?;
        let recipients = new.all_recipients();

        if recipients.is_empty() || recipients.len() > MAX_RECIPIENTS {
            return Err(Error::BadRequest("recipient count out of bounds".into()));
        }
        if new.html.is_none() && new.text.is_none() && new.template.is_none() {
            return Err(Error::BadRequest("at least one of html/text/template is required".into()));
        }

        let size_bytes = new.estimated_size_bytes();
        if size_bytes as usize > self.max_message_bytes {
            return Err(Error::BadRequest("message exceeds max_message_bytes".into()));
        }

        for recipient in &recipients {
            if self.suppression.is_suppressed(tenant_id, recipient).await? {
                return Err(Error::Suppressed(recipient.clone()));
            }
        }

        let tenant = self.tenants.get(tenant_id).await?.ok_or(Error::NotFound("tenant not found"))?;
        let sender_domain = sender.domain().to_string();

        let (signing_domain, fallback_used) = self.dkim.resolve_signing_domain(tenant_id, &sender_domain).await?;
        if let Some(domain) = &signing_domain {
            if domain.status != VerificationStatus::Verified {
                return Err(Error::DomainNotVerified(sender_domain));
            }
        }
        let _ = fallback_used; // fallback is allowed, not rejected; see module doc.

        let mut headers = new.headers.clone();
        headers.insert("Subject".to_string(), new.subject.clone());

        let message_id = generate_message_id(&self.hostname);
        let email = self
            .emails
            .create_received(
                tenant_id,
                message_id,
                Direction::Outbound,
                new.from.clone(),
                recipients.clone(),
                headers,
                new.html.clone(),
                new.text.clone(),
                new.template.clone(),
                size_bytes,
                idempotency_key,
            )
            .await?;

        self.emails.transition(email.id, EmailState::Validated).await?;

        // step 2: daily quota, then rate-limit admission across all five
        // scopes. Quota is checked before the per-window scopes since it's
        // the cheapest and most final rejection.
        if !self.tenants.try_consume_daily_quota(tenant_id).await? {
            self.emails.transition(email.id, EmailState::Failed).await?;
            return Err(Error::QuotaExceeded);
        }

        for recipient_domain in recipients.iter().filter_map(|r| r.rsplit_once('@').map(|(_, d)| d)) {
            let admission = self
                .rate_limiter
                .admit_send(tenant_id, tenant.plan, &sender_domain, recipient_domain, &source_ip.to_string())
                .await?;
            if !admission.allowed() {
                let scope = admission.first_violation().map(|d| d.scope);
                self.emails.transition(email.id, EmailState::Deferred).await?;
                return Err(Error::RateLimited(format!("{scope:?}")));
            }
        }

        self.emails.transition(email.id, EmailState::Queued).await?;
        self.analytics
            .record(
                tenant_id,
                signing_domain.as_ref().map(|d| d.id),
                Some(email.id),
                EventType::Queued,
                serde_json::json!({ "message_id": email.message_id }),
            )
            .await
            .ok();

        self.queue.push(tenant_id, DELIVERY_QUEUE, &DeliveryJob { email_id: email.id }, None, self.retry.max_attempts as i64).await?;
        self.bus.publish(BusMessage::EmailReadyToSend(email.id));

        self.emails.get(tenant_id, email.id).await?.ok_or(Error::NotFound("email not found"))
    }

    /// One worker iteration: leases the next due delivery job for `tenant_id`
    /// and drives it through signing and sending. Returns `false` when there
    /// was nothing due, so the caller can back off before polling again.
    pub async fn process_one(&self, tenant_id: TenantId, worker_id: &str) -> Result<bool, Error> {
        let Some((item, job)) = self.queue.lease::<DeliveryJob>(tenant_id, DELIVERY_QUEUE, worker_id).await? else {
            return Ok(false);
        };

        let attempt_number = self.emails.increment_attempts(job.email_id).await?;

        match self.deliver(item.tenant_id, job.email_id, attempt_number).await {
            Ok(Advance::Done) => self.queue.complete(item.id).await?,
            Ok(Advance::Retry(next_at)) => {
                self.queue.release(item.id, next_at).await?;
            }
            Err(err) => {
                warn!(email_id = %job.email_id, "delivery attempt errored: {err}");
                self.queue.release(item.id, Utc::now() + chrono::Duration::minutes(1)).await?;
            }
        }

        Ok(true)
    }

    /// `queued → signing → sending → {sent|deferred|bounced|failed}`
    ///. Re-renders and re-signs the message on
    /// every attempt rather than persisting signed bytes, since the model
    /// only stores which domain/selector was used, not the signature text
    /// itself — cheap for typical transactional message sizes and avoids a
    /// `signed_body` column whose only reader would be the retry path.
    async fn deliver(&self, tenant_id: TenantId, email_id: EmailId, attempt_number: i64) -> Result<Advance, Error> {
        let email = self.emails.get(tenant_id, email_id).await?.ok_or(Error::NotFound("email not found"))?;
        if email.state.is_terminal() {
            return Ok(Advance::Done);
        }
        if email.state == EmailState::Queued {
            self.emails.transition(email_id, EmailState::Signing).await?;
        }

        let sender_domain = email.envelope_from.rsplit_once('@').map(|(_, d)| d).unwrap_or("");
        let (signing_domain, _) = self.dkim.resolve_signing_domain(tenant_id, sender_domain).await?;

        let raw = render_message(&email)?;
        let parsed = mail_parser::MessageParser::default()
            .parse(&raw)
            .ok_or_else(|| Error::Internal("failed to parse rendered message".into()))?;
        let signing = self.dkim.sign(signing_domain.as_ref(), self.fallback_domain_id, &parsed).await?;
        self.emails.record_signing(email_id, &signing.domain_used, signing.fallback_used).await?;

        let mut signed = signing.dkim_signature_header.into_bytes();
        signed.extend_from_slice(&raw);

        self.emails.transition(email_id, EmailState::Sending).await?;

        let mut by_domain: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for recipient in &email.envelope_to {
            if let Some((_, domain)) = recipient.rsplit_once('@') {
                by_domain.entry(domain).or_default().push(recipient.as_str());
            }
        }

        let mut worst: Option<DeliveryOutcome> = None;
        for (domain, recipients) in &by_domain {
            let message = smtp::message::Message {
                mail_from: email.envelope_from.as_str().into(),
                rcpt_to: recipients.iter().map(|r| (*r).into()).collect(),
                body: signed.as_slice().into(),
            };
            let outcome = self.transport.deliver(domain, message).await;

            self.emails
                .record_attempt(
                    email_id,
                    attempt_number,
                    outcome.mx_host.as_deref(),
                    outcome.duration.as_millis() as i64,
                    outcome.smtp_response_code.map(i32::from),
                    outcome.smtp_response_text.as_deref(),
                    outcome.classification,
                    None,
                )
                .await?;

            if worst.as_ref().is_none_or(|w| rank(outcome.classification) >= rank(w.classification)) {
                worst = Some(outcome);
            }
        }

        self.bus.publish(BusMessage::DeliveryAttempted(tenant_id, email_id));

        let outcome = worst.ok_or_else(|| Error::Internal("no recipient domains resolved".into()))?;

        match outcome.classification {
            AttemptClassification::Success => {
                self.emails.transition(email_id, EmailState::Sent).await?;
                self.emit(tenant_id, email_id, &email, EventType::Sent).await;
                Ok(Advance::Done)
            }
            AttemptClassification::Permanent => {
                let code = outcome.smtp_response_code.unwrap_or(550);
                let enhanced = outcome.smtp_response_text.as_deref().and_then(enhanced_status_code);
                let class = bounce::classify_smtp(code as u16, enhanced);
                if let Some(reason) = class.suppression_reason() {
                    for recipient in &email.envelope_to {
                        self.suppression.suppress(tenant_id, recipient, reason, "bounce-classifier", None).await.ok();
                    }
                }
                self.emails
                    .record_error(email_id, outcome.smtp_response_text.as_deref().unwrap_or("permanent failure"))
                    .await?;
                self.emails.transition(email_id, EmailState::Bounced).await?;
                self.emit(tenant_id, email_id, &email, EventType::Bounced).await;
                Ok(Advance::Done)
            }
            AttemptClassification::Transient | AttemptClassification::TlsFail | AttemptClassification::Deferred => {
                self.emails
                    .record_error(email_id, outcome.smtp_response_text.as_deref().unwrap_or("temporary failure"))
                    .await?;

                if attempt_number >= self.retry.max_attempts as i64 {
                    self.emails.transition(email_id, EmailState::Failed).await?;
                    self.emit(tenant_id, email_id, &email, EventType::Rejected).await;
                    Ok(Advance::Done)
                } else {
                    self.emails.transition(email_id, EmailState::Deferred).await?;
                    self.emit(tenant_id, email_id, &email, EventType::Deferred).await;
                    let delay = compute_backoff(attempt_number as u32, &self.retry);
                    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::minutes(1));
                    Ok(Advance::Retry(Utc::now() + delay))
                }
            }
        }
    }

    async fn emit(&self, tenant_id: TenantId, email_id: EmailId, email: &Email, event_type: EventType) {
        self.analytics
            .record(
                tenant_id,
                None,
                Some(email_id),
                event_type,
                serde_json::json!({ "message_id": email.message_id }),
            )
            .await
            .ok();
    }
}

fn rank(classification: AttemptClassification) -> u8 {
    match classification {
        AttemptClassification::Success => 0,
        AttemptClassification::Deferred => 1,
        AttemptClassification::Transient => 2,
        AttemptClassification::TlsFail => 3,
        AttemptClassification::Permanent => 4,
    }
}

/// Backoff formula: `min(max_backoff, base * factor^N) +
/// jitter`, where jitter is a uniform +/- fraction of the capped value.
fn compute_backoff(attempt: u32, retry: &RetryConfig) -> std::time::Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let exp = retry.base.as_secs_f64() * retry.factor.powi(exponent);
    let capped = exp.min(retry.max_backoff.as_secs_f64());
    let spread = capped * retry.jitter;
    let jitter = if spread > 0.0 { rand::rng().random_range(-spread..=spread) } else { 0.0 };
    std::time::Duration::from_secs_f64((capped + jitter).max(0.0))
}

/// Pulls an RFC 3463 enhanced status code (`x.y.z`) out of free-form SMTP
/// response text, if present.
fn enhanced_status_code(text: &str) -> Option<&str> {
    text.split_whitespace().find(|word| {
        let trimmed = word.trim_matches(|c: char| !c.is_ascii_digit() && c != '.');
        trimmed.matches('.').count() == 2 && !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit() || c == '.')
    })
}

/// Renders an `Email` row into an RFC 5322 message ready for DKIM signing
/// and transport. `headers` carries caller-supplied extras (e.g.
/// `List-Unsubscribe`); core headers (From/To/Subject/Date/Message-ID) are
/// derived from the model fields directly.
fn render_message(email: &Email) -> Result<Vec<u8>, Error> {
    let mut builder = mail_send::mail_builder::MessageBuilder::new()
        .from(email.envelope_from.as_str())
        .to(email.envelope_to.iter().map(String::as_str).collect::<Vec<_>>())
        .message_id(email.message_id.trim_matches(|c| c == '<' || c == '>').to_string())
        .date(Utc::now().timestamp());

    if let Some(subject) = email.headers.get("Subject") {
        builder = builder.subject(subject.as_str());
    }
    if let Some(html) = &email.body_html {
        builder = builder.html_body(html.as_str());
    }
    if let Some(text) = &email.body_text {
        builder = builder.text_body(text.as_str());
    }

    let mut raw = Vec::new();
    builder.write_to(&mut raw).map_err(|e| Error::Internal(format!("failed to render message: {e}")))?;

    let mut extra = String::new();
    for (name, value) in &email.headers {
        if name.eq_ignore_ascii_case("Subject") {
            continue;
        }
        extra.push_str(name);
        extra.push_str(": ");
        extra.push_str(value);
        extra.push_str("\r\n");
    }
    if !extra.is_empty() {
        let mut prefixed = extra.into_bytes();
        prefixed.extend_from_slice(&raw);
        raw = prefixed;
    }

    Ok(raw)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_is_capped_and_within_jitter_bounds() {
        let retry = RetryConfig::default();
        for attempt in 1..=10 {
            let delay = compute_backoff(attempt, &retry);
            let uncapped = retry.base.as_secs_f64() * retry.factor.powi(attempt as i32 - 1);
            let capped = uncapped.min(retry.max_backoff.as_secs_f64());
            let spread = capped * retry.jitter;
            assert!(delay.as_secs_f64() <= capped + spread + 1.0);
        }
    }

    #[test]
    fn rank_orders_permanent_above_success() {
        assert!(rank(AttemptClassification::Permanent) > rank(AttemptClassification::Success));
        assert!(rank(AttemptClassification::Transient) > rank(AttemptClassification::Deferred));
    }

    #[test]
    fn extracts_enhanced_status_code_from_response_text() {
        assert_eq!(enhanced_status_code("550 5.1.1 no such user"), Some("5.1.1"));
        assert_eq!(enhanced_status_code("421 try again later"), None);
    }

    #[test]
    fn renders_message_with_custom_headers_prepended() {
        let email = Email {
            id: EmailId::new(),
            tenant_id: TenantId::new(),
            message_id: "<abc@mail.example>".into(),
            direction: Direction::Outbound,
            envelope_from: "alerts@t1.com".into(),
            envelope_to: vec!["ops@example.net".into()],
            headers: BTreeMap::from([
                ("Subject".to_string(), "hi".to_string()),
                ("List-Unsubscribe".to_string(), "<mailto:unsub@t1.com>".to_string()),
            ]),
            body_html: Some("<p>hi</p>".into()),
            body_text: None,
            template_ref: None,
            state: EmailState::Queued,
            attempts: 0,
            last_error: None,
            dkim_domain_used: None,
            fallback_used: false,
            size_bytes: 10,
            idempotency_key: None,
            created_at: Utc::now(),
            finalized_at: None,
        };

        let raw = render_message(&email).unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("List-Unsubscribe:"));
        assert!(text.contains("Subject: hi"));
    }
}
