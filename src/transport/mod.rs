//! Direct-to-MX outbound transport: resolves MX records,
//! opens an SMTP client to each candidate in priority order, delivers, and
//! classifies the response.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mail_send::{smtp, SmtpClient, SmtpClientBuilder};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::dns::{DnsResolver, ResolveError};
use crate::models::AttemptClassification;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protection {
    Plaintext,
    Tls,
}

/// Outcome of a single delivery attempt against one recipient domain.
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub mx_host: Option<String>,
    pub duration: Duration,
    pub smtp_response_code: Option<u16>,
    pub smtp_response_text: Option<String>,
    pub classification: AttemptClassification,
}

#[derive(Clone)]
pub struct Transport {
    resolver: DnsResolver,
    hostname: String,
    allow_plaintext: bool,
    command_timeout: Duration,
    per_domain_limit: usize,
    domain_semaphores: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl Transport {
    pub fn new(resolver: DnsResolver, config: &Config) -> Self {
        Transport {
            resolver,
            hostname: config.hostname.clone(),
            allow_plaintext: !config.environment.is_production(),
            command_timeout: Duration::from_secs(60),
            per_domain_limit: config.worker.per_recipient_domain,
            domain_semaphores: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the semaphore gating concurrent deliveries to `domain`,
    /// creating it on first use. A shared mailbox provider only ever sees
    /// `per_domain_limit` connections from this process at once, regardless
    /// of how many tenants are sending to it concurrently.
    async fn acquire_domain_permit(&self, domain: &str) -> OwnedSemaphorePermit {
        let semaphore = {
            let mut semaphores = self.domain_semaphores.lock().expect("domain semaphore map poisoned");
            semaphores.entry(domain.to_string()).or_insert_with(|| Arc::new(Semaphore::new(self.per_domain_limit))).clone()
        };
        semaphore.acquire_owned().await.expect("domain semaphore never closed")
    }

    /// Walks the MX set for `recipient_domain` in ascending preference,
    /// trying each candidate until one accepts the message or the set is
    /// exhausted. Serialized per recipient domain by `acquire_domain_permit`
    /// so one chatty destination can't starve deliveries to every other
    /// domain.
    pub async fn deliver(&self, recipient_domain: &str, message: smtp::message::Message<'_>) -> DeliveryOutcome {
        let _permit = self.acquire_domain_permit(recipient_domain).await;
        let mut priority = 0..65536;
        let mut worst: Option<DeliveryOutcome> = None;

        loop {
            match self.resolver.resolve_mail_domain(recipient_domain, &mut priority).await {
                Ok((hostname, port)) => {
                    let started = Instant::now();
                    let outcome = self.attempt(recipient_domain, &hostname, port, message.clone(), started).await;
                    if matches!(outcome.classification, AttemptClassification::Success) {
                        return outcome;
                    }
                    let should_stop = matches!(outcome.classification, AttemptClassification::Permanent);
                    worst = Some(outcome);
                    if should_stop {
                        return worst.unwrap();
                    }
                }
                Err(ResolveError::AllServersExhausted) => {
                    info!(domain = recipient_domain, "all mail servers exhausted");
                    break;
                }
                Err(ResolveError::Dns(err)) => {
                    warn!(domain = recipient_domain, "could not resolve mail domain: {err}");
                    return DeliveryOutcome {
                        mx_host: None,
                        duration: Duration::default(),
                        smtp_response_code: None,
                        smtp_response_text: Some(err.to_string()),
                        classification: AttemptClassification::Transient,
                    };
                }
            }
        }

        worst.unwrap_or(DeliveryOutcome {
            mx_host: None,
            duration: Duration::default(),
            smtp_response_code: None,
            smtp_response_text: Some("no MX candidates available".into()),
            classification: AttemptClassification::Transient,
        })
    }

    async fn attempt(
        &self,
        recipient_domain: &str,
        hostname: &str,
        port: u16,
        message: smtp::message::Message<'_>,
        started: Instant,
    ) -> DeliveryOutcome {
        let order: &[Protection] =
            if self.allow_plaintext { &[Protection::Tls, Protection::Plaintext] } else { &[Protection::Tls] };

        let mut last = None;
        for &protection in order {
            let result = self.send_via(hostname, port, protection, message.clone()).await;
            if result.is_ok() {
                trace!(domain = recipient_domain, hostname, port, "delivered");
                return DeliveryOutcome {
                    mx_host: Some(hostname.to_string()),
                    duration: started.elapsed(),
                    smtp_response_code: Some(250),
                    smtp_response_text: Some("delivered".into()),
                    classification: AttemptClassification::Success,
                };
            }
            last = result.err();
        }

        let classification = last.as_ref().map(classify).unwrap_or(AttemptClassification::Transient);
        let (code, text) = last.as_ref().map(response_detail).unwrap_or((None, None));

        debug!(domain = recipient_domain, hostname, port, ?classification, "delivery attempt failed");

        DeliveryOutcome {
            mx_host: Some(hostname.to_string()),
            duration: started.elapsed(),
            smtp_response_code: code,
            smtp_response_text: text,
            classification,
        }
    }

    async fn send_via(
        &self,
        hostname: &str,
        port: u16,
        protection: Protection,
        message: smtp::message::Message<'_>,
    ) -> Result<(), mail_send::Error> {
        let builder = SmtpClientBuilder::new(hostname, port)
            .implicit_tls(false)
            .say_ehlo(true)
            .helo_host(&self.hostname)
            .timeout(self.command_timeout);

        match protection {
            Protection::Tls => {
                let mut client: SmtpClient<_> = builder.connect().await?;
                let result = client.send(message).await;
                quit(client).await;
                result
            }
            Protection::Plaintext => {
                let mut client: SmtpClient<_> = builder.connect_plain().await?;
                let result = client.send(message).await;
                quit(client).await;
                result
            }
        }
    }
}

async fn quit<T>(client: SmtpClient<T>)
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    client.quit().await.ok();
}

fn classify(err: &mail_send::Error) -> AttemptClassification {
    match err {
        mail_send::Error::Io(_) => AttemptClassification::Transient,
        mail_send::Error::Tls(_) => AttemptClassification::TlsFail,
        mail_send::Error::InvalidTLSName => AttemptClassification::TlsFail,
        mail_send::Error::MissingStartTls => AttemptClassification::TlsFail,
        mail_send::Error::Timeout => AttemptClassification::Transient,
        mail_send::Error::Base64(_) => AttemptClassification::Transient,
        mail_send::Error::Auth(_) => AttemptClassification::Permanent,
        mail_send::Error::UnparseableReply => AttemptClassification::Transient,
        mail_send::Error::UnexpectedReply(response) | mail_send::Error::AuthenticationFailed(response) => {
            if response.severity() == smtp_proto::Severity::TransientNegativeCompletion {
                AttemptClassification::Transient
            } else {
                AttemptClassification::Permanent
            }
        }
        mail_send::Error::MissingCredentials
        | mail_send::Error::MissingMailFrom
        | mail_send::Error::MissingRcptTo
        | mail_send::Error::UnsupportedAuthMechanism => AttemptClassification::Permanent,
    }
}

fn response_detail(err: &mail_send::Error) -> (Option<u16>, Option<String>) {
    match err {
        mail_send::Error::UnexpectedReply(response) | mail_send::Error::AuthenticationFailed(response) => {
            (Some(response.code), Some(response.message.clone()))
        }
        other => (None, Some(other.to_string())),
    }
}

/// Picks the outbound source IP for a delivery attempt; a single-address
/// deployment simply has one entry.
pub fn select_outbound_ip(candidates: &[IpAddr]) -> Option<IpAddr> {
    candidates.first().copied()
}

#[cfg(test)]
mod test {
    use super::*;
    use smtp_proto::Response;

    #[test]
    fn classifies_transient_io_and_timeout() {
        assert_eq!(classify(&mail_send::Error::Timeout), AttemptClassification::Transient);
        assert_eq!(classify(&mail_send::Error::MissingMailFrom), AttemptClassification::Permanent);
    }

    #[test]
    fn classifies_tls_errors_as_tls_fail() {
        assert_eq!(classify(&mail_send::Error::InvalidTLSName), AttemptClassification::TlsFail);
        assert_eq!(classify(&mail_send::Error::MissingStartTls), AttemptClassification::TlsFail);
    }

    #[test]
    fn classifies_unexpected_reply_by_severity() {
        let transient = Response { code: 450, esc: [4, 2, 2], message: "mailbox busy".into() };
        assert_eq!(
            classify(&mail_send::Error::UnexpectedReply(transient)),
            AttemptClassification::Transient
        );

        let permanent = Response { code: 550, esc: [5, 1, 1], message: "no such user".into() };
        assert_eq!(
            classify(&mail_send::Error::UnexpectedReply(permanent)),
            AttemptClassification::Permanent
        );
    }

    #[test]
    fn response_detail_extracts_code_and_message() {
        let response = Response { code: 550, esc: [5, 1, 1], message: "no such user".into() };
        let (code, text) = response_detail(&mail_send::Error::UnexpectedReply(response));
        assert_eq!(code, Some(550));
        assert_eq!(text.as_deref(), Some("no such user"));
    }

    #[test]
    fn select_outbound_ip_picks_first_candidate() {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(select_outbound_ip(&[a, b]), Some(a));
        assert_eq!(select_outbound_ip(&[]), None);
    }

    fn test_config(per_recipient_domain: usize) -> Config {
        Config {
            environment: crate::config::Environment::Development,
            hostname: "mail.test.example".into(),
            api_addr: "127.0.0.1:0".parse().unwrap(),
            mx_addr: "127.0.0.1:0".parse().unwrap(),
            submission_addr: "127.0.0.1:0".parse().unwrap(),
            max_message_bytes: 1024 * 1024,
            worker: crate::config::WorkerConfig { delivery_concurrency: 4, per_recipient_domain },
            retry: crate::config::RetryConfig::default(),
            dkim: crate::config::DkimConfig { fallback_domain: "mail.test.example".into() },
            rate_limit: crate::config::RateLimitConfig::default(),
            tls: crate::config::TlsConfig { cert_path: "cert.pem".into(), key_path: "key.pem".into() },
            database_url: "sqlite::memory:".into(),
            storage_backend: crate::config::StorageBackend::Sqlite,
            log_level: "info".into(),
            session_key_material: b"test-key".to_vec(),
            analytics_retention_days: 30,
            idempotency_window_hours: 24,
            nameservers: vec!["9.9.9.9:853".parse().unwrap()],
        }
    }

    #[tokio::test]
    async fn domain_permits_are_capped_and_shared_per_domain() {
        let config = test_config(2);
        let resolver = DnsResolver::new(&config);
        let transport = Transport::new(resolver, &config);

        let first = transport.acquire_domain_permit("a.com").await;
        let second = transport.acquire_domain_permit("a.com").await;

        let third = tokio::time::timeout(Duration::from_millis(50), transport.acquire_domain_permit("a.com")).await;
        assert!(third.is_err(), "third permit for the same domain should block while two are held");

        // a different domain has its own semaphore and isn't starved by a.com.
        let other = tokio::time::timeout(Duration::from_millis(50), transport.acquire_domain_permit("b.com")).await;
        assert!(other.is_ok());

        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(50), transport.acquire_domain_permit("a.com")).await;
        assert!(third.is_ok(), "releasing a permit should admit the next waiter");
        drop(second);
    }
}
