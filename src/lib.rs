//! Self-hosted transactional email platform: an HTTP admission API, a
//! direct-to-MX delivery engine, and the SMTP listeners that feed it.
//! `src/bin/*.rs` are thin process entry points; everything they need is
//! assembled here so every binary boots an identically-wired `AppContext`.

pub mod analytics;
pub mod api;
pub mod bounce;
pub mod bus;
pub mod config;
pub mod dkim;
pub mod dns;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod rate_limiter;
pub mod smtp;
pub mod storage;
pub mod tenant_context;
pub mod transport;
pub mod webhook;

use std::sync::Arc;

use base64ct::{Base64, Encoding};
use sqlx::AnyPool;
use tokio::signal;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::analytics::Analytics;
use crate::api::{ApiServer, ApiState};
use crate::bus::Bus;
use crate::config::Config;
use crate::dkim::DkimEngine;
use crate::dns::DnsResolver;
use crate::models::{
    AnalyticsRepository, ApiKeyRepository, DkimAlgorithm, Domain, DomainId, DomainRepository, EmailRepository, Error,
    NewDomain, NewTenant, Plan, SuppressionRepository, TenantRepository, VerificationStatus, WebhookRepository,
};
use crate::pipeline::Pipeline;
use crate::queue::Queue;
use crate::rate_limiter::RateLimiter;
use crate::smtp::connection::{EnvelopeSink, SubmissionAuthenticator};
use crate::smtp::server::{serve_mx, serve_submission};
use crate::smtp::session::{AcceptedEnvelope, ListenerRole};
use crate::tenant_context::TenantContext;
use crate::transport::Transport;
use crate::webhook::WebhookFanout;

const FALLBACK_SELECTOR: &str = "uzfallback";
const FALLBACK_TENANT_NAME: &str = "system";

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info,tower_http=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = token.cancelled() => {}
    }
}

/// Every service module, built once from a pool + config and shared by
/// every binary; which pieces a given process actually drives is decided
/// by the `run_*` function it calls, not by this struct.
#[derive(Clone)]
pub struct AppContext {
    pub pool: AnyPool,
    pub config: Arc<Config>,
    pub tenants: TenantRepository,
    pub domains: DomainRepository,
    pub api_keys: ApiKeyRepository,
    pub emails: EmailRepository,
    pub suppression: SuppressionRepository,
    pub webhooks: WebhookRepository,
    pub analytics: AnalyticsRepository,
    pub queue: Queue,
    pub bus: Bus,
    pub dns: DnsResolver,
    pub webhook_fanout: WebhookFanout,
    pub pipeline: Pipeline,
    pub tenant_context: TenantContext,
    pub fallback_domain_id: DomainId,
}

impl AppContext {
    pub async fn build(pool: AnyPool, config: Config) -> Result<Self, Error> {
        let config = Arc::new(config);

        let tenants = TenantRepository::new(pool.clone());
        let domains = DomainRepository::new(pool.clone());
        let api_keys = ApiKeyRepository::new(pool.clone());
        let emails = EmailRepository::new(pool.clone());
        let suppression = SuppressionRepository::new(pool.clone());
        let webhooks = WebhookRepository::new(pool.clone());
        let analytics = AnalyticsRepository::new(pool.clone());
        let rate_limit = crate::models::RateLimitRepository::new(pool.clone());

        let queue = Queue::new(pool.clone());
        let bus = Bus::new();
        let dns = DnsResolver::new(&config);
        let rate_limiter = RateLimiter::new(rate_limit, config.rate_limit.clone());
        let webhook_fanout = WebhookFanout::new(webhooks.clone());
        let analytics_service = Analytics::new(analytics.clone(), webhook_fanout.clone(), 30);
        let transport = Transport::new(dns.clone(), &config);

        let fallback_domain_id = ensure_fallback_domain(&tenants, &domains, &config).await?;
        let dkim = DkimEngine::new(domains.clone(), &config, FALLBACK_SELECTOR.to_string());

        let pipeline = Pipeline::new(
            emails.clone(),
            domains.clone(),
            tenants.clone(),
            suppression.clone(),
            rate_limiter,
            dkim,
            transport,
            queue.clone(),
            analytics_service,
            bus.clone(),
            fallback_domain_id,
            &config,
        );

        let tenant_context = TenantContext::new(tenants.clone(), api_keys.clone());

        Ok(AppContext {
            pool,
            config,
            tenants,
            domains,
            api_keys,
            emails,
            suppression,
            webhooks,
            analytics,
            queue,
            bus,
            dns,
            webhook_fanout,
            pipeline,
            tenant_context,
            fallback_domain_id,
        })
    }
}

/// The system's own verified sending identity, used whenever a tenant sends
/// from a domain that isn't registered and verified yet. It
/// lives under a dedicated `system` tenant so it never collides with a
/// customer's own domains table rows.
async fn ensure_fallback_domain(tenants: &TenantRepository, domains: &DomainRepository, config: &Config) -> Result<DomainId, Error> {
    if let Some(existing) = domains.find_by_name(&config.dkim.fallback_domain).await? {
        return Ok(existing.id);
    }

    let system_tenant = match tenants.list().await?.into_iter().find(|t| t.name == FALLBACK_TENANT_NAME) {
        Some(t) => t,
        None => tenants.create(NewTenant { name: FALLBACK_TENANT_NAME.to_string(), plan: Plan::Business }).await?,
    };

    let created = domains
        .create(
            system_tenant.id,
            NewDomain { name: config.dkim.fallback_domain.clone(), dkim_algorithm: DkimAlgorithm::RsaSha256 },
        )
        .await?;
    domains.mark_checked(created.id, VerificationStatus::Verified).await?;
    Ok(created.id)
}

pub async fn run_api(ctx: &AppContext, shutdown: CancellationToken) -> std::io::Result<tokio::task::JoinHandle<std::io::Result<()>>> {
    let state = ApiState {
        pool: ctx.pool.clone(),
        pipeline: ctx.pipeline.clone(),
        tenant_context: ctx.tenant_context.clone(),
        tenants: ctx.tenants.clone(),
        domains: ctx.domains.clone(),
        api_keys: ctx.api_keys.clone(),
        emails: ctx.emails.clone(),
        webhooks: ctx.webhooks.clone(),
        webhook_fanout: ctx.webhook_fanout.clone(),
        analytics: ctx.analytics.clone(),
        dns: ctx.dns.clone(),
        config: ctx.config.clone(),
        idempotency_window: chrono::Duration::hours(ctx.config.idempotency_window_hours),
    };

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        tx.send(()).ok();
    });

    let server = ApiServer::new(ctx.config.api_addr, state, rx).await?;
    Ok(server.spawn())
}

/// Hands an MX-ingested envelope to the inbound bounce/complaint pipeline:
/// classifies ARF feedback reports and suppresses the reported address,
/// records everything else as an observed inbound event.
struct InboundSink {
    suppression: SuppressionRepository,
    analytics: AnalyticsRepository,
    system_tenant: crate::models::TenantId,
}

#[async_trait::async_trait]
impl EnvelopeSink for InboundSink {
    async fn accept(&self, role: ListenerRole, _peer: std::net::SocketAddr, envelope: AcceptedEnvelope) -> Result<(), String> {
        if role != ListenerRole::Mx {
            return Ok(());
        }

        let parsed = mail_parser::MessageParser::default().parse(&envelope.raw);
        let Some(message) = parsed else {
            warn!("failed to parse inbound message from {}", envelope.from);
            return Ok(());
        };

        let content_type = message
            .content_type()
            .map(|ct| format!("{}/{}", ct.ctype(), ct.subtype().unwrap_or_default()))
            .unwrap_or_default();
        let body = message.body_text(0).map(|b| b.to_string()).unwrap_or_default();

        if bounce::is_arf_complaint(&content_type, &body) {
            for recipient in original_recipients(&message) {
                if let Err(err) = self
                    .suppression
                    .suppress(self.system_tenant, &recipient, crate::models::SuppressionReason::Complaint, "arf-report", None)
                    .await
                {
                    error!("failed to record suppression for {recipient}: {err}");
                }
            }
        }

        self.analytics
            .record(
                self.system_tenant,
                None,
                None,
                crate::models::EventType::Bounced,
                serde_json::json!({ "from": envelope.from, "to": envelope.to }),
            )
            .await
            .ok();

        Ok(())
    }
}

/// Pulls `Original-Rcpt-To` addresses out of an ARF report's
/// `message/feedback-report` body part; falls back to the envelope
/// recipient when the structured part isn't present.
fn original_recipients(message: &mail_parser::Message<'_>) -> Vec<String> {
    let mut found = Vec::new();
    for part in message.text_bodies() {
        if let Some(text) = part.text_contents() {
            for line in text.lines() {
                if let Some(addr) = line.strip_prefix("Original-Rcpt-To:").map(str::trim) {
                    found.push(addr.trim_start_matches("rfc822;").trim().to_string());
                }
            }
        }
    }
    found
}

/// The Submission listener re-enters the outbound pipeline exactly as if
/// the message had been posted through `POST /emails`.
struct SubmissionSink {
    pipeline: Pipeline,
}

#[async_trait::async_trait]
impl EnvelopeSink for SubmissionSink {
    async fn accept(&self, role: ListenerRole, peer: std::net::SocketAddr, envelope: AcceptedEnvelope) -> Result<(), String> {
        if role != ListenerRole::Submission {
            return Ok(());
        }
        let Some(tenant_id) = envelope.authenticated_tenant else {
            return Err("authentication required".to_string());
        };

        let parsed = mail_parser::MessageParser::default().parse(&envelope.raw).ok_or("unparseable message")?;
        let subject = parsed.subject().unwrap_or_default().to_string();
        let html = parsed.body_html(0).map(|b| b.to_string());
        let text = parsed.body_text(0).map(|b| b.to_string());

        let new = crate::models::NewEmail {
            from: envelope.from.clone(),
            to: envelope.to.clone(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject,
            html,
            text,
            template: None,
            variables: Default::default(),
            tracking: None,
            headers: Default::default(),
        };

        self.pipeline.submit(tenant_id, new, peer.ip(), None).await.map_err(|err| err.to_string())?;
        Ok(())
    }
}

struct ApiKeyAuthenticator {
    api_keys: ApiKeyRepository,
}

#[async_trait::async_trait]
impl SubmissionAuthenticator for ApiKeyAuthenticator {
    async fn authenticate(&self, _username: &str, password: &str) -> Option<crate::models::TenantId> {
        self.api_keys.authenticate(password).await.ok().map(|key| key.tenant_id)
    }
}

struct NoAuth;

#[async_trait::async_trait]
impl SubmissionAuthenticator for NoAuth {
    async fn authenticate(&self, _username: &str, _password: &str) -> Option<crate::models::TenantId> {
        None
    }
}

pub async fn run_smtp(ctx: &AppContext, shutdown: CancellationToken) -> Result<(), Error> {
    let system_tenant = tenant_id_for_name(&ctx.tenants, FALLBACK_TENANT_NAME).await?;

    let inbound_sink: Arc<dyn EnvelopeSink> =
        Arc::new(InboundSink { suppression: ctx.suppression.clone(), analytics: ctx.analytics.clone(), system_tenant });
    let submission_sink: Arc<dyn EnvelopeSink> = Arc::new(SubmissionSink { pipeline: ctx.pipeline.clone() });
    let api_key_auth: Arc<dyn SubmissionAuthenticator> = Arc::new(ApiKeyAuthenticator { api_keys: ctx.api_keys.clone() });
    let no_auth: Arc<dyn SubmissionAuthenticator> = Arc::new(NoAuth);

    let config = ctx.config.clone();
    let mx_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = serve_mx(config, inbound_sink, no_auth, mx_shutdown).await {
            error!("mx listener stopped: {err}");
        }
    });

    let config = ctx.config.clone();
    tokio::spawn(async move {
        if let Err(err) = serve_submission(config, submission_sink, api_key_auth, shutdown).await {
            error!("submission listener stopped: {err}");
        }
    });

    Ok(())
}

async fn tenant_id_for_name(tenants: &TenantRepository, name: &str) -> Result<crate::models::TenantId, Error> {
    tenants
        .list()
        .await?
        .into_iter()
        .find(|t| t.name == name)
        .map(|t| t.id)
        .ok_or(Error::NotFound("system tenant not found"))
}

/// Runs `Pipeline::process_one` in a loop, backing off when the queue is
/// empty so an idle worker doesn't spin-poll the database. Each iteration
/// walks the tenant list and leases one job per tenant in turn — `Queue::lease`
/// is itself `tenant_id`-scoped at the SQL level, so no worker can ever pull
/// another tenant's job off the queue.
pub async fn run_workers(ctx: &AppContext, worker_id: String, concurrency: usize, shutdown: CancellationToken) {
    let mut handles = Vec::with_capacity(concurrency);
    for n in 0..concurrency {
        let pipeline = ctx.pipeline.clone();
        let tenants = ctx.tenants.clone();
        let worker_id = format!("{worker_id}-{n}");
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    return;
                }

                let tenant_ids = match tenants.list().await {
                    Ok(rows) => rows.into_iter().map(|t| t.id).collect::<Vec<_>>(),
                    Err(err) => {
                        error!("worker {worker_id} failed to list tenants: {err}");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };

                let mut processed_any = false;
                for tenant_id in tenant_ids {
                    match pipeline.process_one(tenant_id, &worker_id).await {
                        Ok(true) => processed_any = true,
                        Ok(false) => {}
                        Err(err) => error!("worker {worker_id} iteration failed for tenant {tenant_id}: {err}"),
                    }
                }

                if !processed_any {
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
            }
        }));
    }
    for handle in handles {
        handle.await.ok();
    }
}

/// The re-check delay currently in effect for a `Pending` domain, keyed off
/// its total age: 1m, 5m, 15m, 1h, 6h, then 24h from then on. Each tier's
/// threshold is the cumulative sum of the tiers before it, so a domain ages
/// through the schedule exactly once rather than restarting it on every poll.
fn next_poll_delay(age_since_created: chrono::Duration) -> chrono::Duration {
    let tiers = [
        chrono::Duration::minutes(1),
        chrono::Duration::minutes(5),
        chrono::Duration::minutes(15),
        chrono::Duration::hours(1),
        chrono::Duration::hours(6),
        chrono::Duration::hours(24),
    ];
    let mut cumulative = chrono::Duration::zero();
    for tier in tiers {
        cumulative = cumulative + tier;
        if age_since_created < cumulative {
            return tier;
        }
    }
    chrono::Duration::hours(24)
}

const DOMAIN_POLL_GIVE_UP_AFTER_DAYS: i64 = 7;

/// Re-runs the ownership/DKIM checks for one `Pending` domain. Unlike the
/// API-driven `verify` handler, a failed check here just leaves the domain
/// `Pending` for the next poll — only `run_periodic`'s 7-day age cutoff
/// ever moves a domain to `Failed`.
async fn poll_domain_verification(ctx: &AppContext, domain: &Domain) -> Result<VerificationStatus, Error> {
    let (info, _key) = ctx.domains.active_dkim_key(domain.id).await?;
    let pubkey_der = Base64::decode_vec(&info.public_key_base64)
        .map_err(|e| Error::Internal(format!("invalid stored dkim key: {e}")))?;

    let result = ctx
        .dns
        .verify_domain(&domain.name, &domain.verification_token, &info.selector, &pubkey_der, &ctx.config.dkim.fallback_domain)
        .await;

    let status = if result.ownership_token.is_success() && result.dkim.is_success() {
        VerificationStatus::Verified
    } else {
        VerificationStatus::Pending
    };
    ctx.domains.mark_checked(domain.id, status).await?;
    Ok(status)
}

/// Walks every `Pending` domain and either re-checks it (if its backoff
/// tier is due) or gives up on it (if it's been pending longer than
/// `DOMAIN_POLL_GIVE_UP_AFTER_DAYS`).
async fn poll_pending_domains(ctx: &AppContext) {
    let pending = match ctx.domains.list_pending().await {
        Ok(pending) => pending,
        Err(err) => {
            error!("failed to list pending domains for verification poll: {err}");
            return;
        }
    };

    let now = chrono::Utc::now();
    for domain in pending {
        let age = now - domain.created_at;
        if age >= chrono::Duration::days(DOMAIN_POLL_GIVE_UP_AFTER_DAYS) {
            if let Err(err) = ctx.domains.mark_checked(domain.id, VerificationStatus::Failed).await {
                error!("giving up on domain {} failed: {err}", domain.name);
            } else {
                warn!("giving up on domain {} after {} days unverified", domain.name, DOMAIN_POLL_GIVE_UP_AFTER_DAYS);
            }
            continue;
        }

        let due = match domain.last_checked_at {
            Some(last) => now - last >= next_poll_delay(age),
            None => age >= chrono::Duration::minutes(1),
        };
        if !due {
            continue;
        }

        match poll_domain_verification(ctx, &domain).await {
            Ok(VerificationStatus::Verified) => info!("domain {} verified on periodic poll", domain.name),
            Ok(_) => {}
            Err(err) => error!("domain verification poll failed for {}: {err}", domain.name),
        }
    }
}

/// Resets every tenant's daily send counter and drops each from the
/// `TenantContext` cache, so a tenant that was near its quota doesn't keep
/// getting throttled on yesterday's `used_today` for up to the cache TTL
/// after midnight.
async fn reset_daily_quotas_and_invalidate_cache(ctx: &AppContext) -> Result<u64, Error> {
    let count = ctx.tenants.reset_daily_quotas().await?;
    for tenant in ctx.tenants.list().await? {
        ctx.tenant_context.invalidate(tenant.id).await;
    }
    Ok(count)
}

/// Background maintenance: webhook retry drain, stale-lease reclamation,
/// pending-domain verification polling, daily quota reset, and analytics
/// retention pruning.
pub async fn run_periodic(ctx: &AppContext, shutdown: CancellationToken) {
    let ctx = ctx.clone();
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
    let mut last_quota_reset = chrono::Utc::now().date_naive();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("periodic worker shutting down");
                return;
            }
            _ = ticker.tick() => {
                match ctx.webhook_fanout.drain_due(100).await {
                    Ok(count) if count > 0 => info!("delivered {count} due webhook attempts"),
                    Ok(_) => {}
                    Err(err) => error!("webhook drain failed: {err}"),
                }

                if let Err(err) = ctx.queue.reclaim_stale(chrono::Duration::minutes(10)).await {
                    error!("queue reclaim failed: {err}");
                }

                poll_pending_domains(&ctx).await;

                let today = chrono::Utc::now().date_naive();
                if today != last_quota_reset {
                    match reset_daily_quotas_and_invalidate_cache(&ctx).await {
                        Ok(count) => info!("reset daily quota for {count} tenants"),
                        Err(err) => error!("daily quota reset failed: {err}"),
                    }
                    last_quota_reset = today;
                }

                if let Err(err) = ctx.analytics.prune_older_than(chrono::Duration::days(30)).await {
                    error!("analytics prune failed: {err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Environment, RetryConfig, StorageBackend, TlsConfig, WorkerConfig};
    use crate::models::Plan;

    async fn memory_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn test_config() -> Config {
        Config {
            environment: Environment::Development,
            hostname: "mail.test.example".to_string(),
            api_addr: "0.0.0.0:0".parse().unwrap(),
            mx_addr: "0.0.0.0:0".parse().unwrap(),
            submission_addr: "0.0.0.0:0".parse().unwrap(),
            max_message_bytes: 25 * 1024 * 1024,
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            dkim: crate::config::DkimConfig { fallback_domain: "mail.fallback.test".to_string() },
            rate_limit: crate::config::RateLimitConfig::default(),
            tls: TlsConfig { cert_path: "cert.pem".to_string(), key_path: "key.pem".to_string() },
            database_url: "sqlite::memory:".to_string(),
            storage_backend: StorageBackend::Sqlite,
            log_level: "info".to_string(),
            session_key_material: b"insecure-development-session-key-change-me-32b".to_vec(),
            analytics_retention_days: 30,
            idempotency_window_hours: 24,
            nameservers: vec!["9.9.9.9:853".parse().unwrap()],
        }
    }

    #[tokio::test]
    async fn ensure_fallback_domain_creates_and_verifies_once() {
        let pool = memory_pool().await;
        let tenants = TenantRepository::new(pool.clone());
        let domains = DomainRepository::new(pool.clone());
        let config = test_config();

        let id = ensure_fallback_domain(&tenants, &domains, &config).await.unwrap();
        let created = domains.get(
            tenants.list().await.unwrap().into_iter().find(|t| t.name == FALLBACK_TENANT_NAME).unwrap().id,
            id,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(created.name, config.dkim.fallback_domain);
        assert_eq!(created.status, VerificationStatus::Verified);

        // Calling again must not create a second system tenant or domain row.
        let id_again = ensure_fallback_domain(&tenants, &domains, &config).await.unwrap();
        assert_eq!(id, id_again);
        let system_tenants: Vec<_> =
            tenants.list().await.unwrap().into_iter().filter(|t| t.name == FALLBACK_TENANT_NAME).collect();
        assert_eq!(system_tenants.len(), 1, "system tenant must be created at most once");
        let _ = Plan::Business;
    }

    #[tokio::test]
    async fn reset_daily_quotas_invalidates_the_cached_tenant() {
        let pool = memory_pool().await;
        let ctx = AppContext::build(pool.clone(), test_config()).await.unwrap();

        let tenant = ctx.tenants.create(NewTenant { name: "Acme".into(), plan: Plan::Free }).await.unwrap();
        let api_key = ctx
            .api_keys
            .create(
                tenant.id,
                crate::models::ApiKeyRequest {
                    description: "ci".into(),
                    permissions: std::collections::BTreeSet::from([crate::models::Permission::SendEmail]),
                },
            )
            .await
            .unwrap();

        assert!(ctx.tenants.try_consume_daily_quota(tenant.id).await.unwrap());

        // populate the cache with the pre-reset (used_today = 1) tenant.
        let cached = ctx.tenant_context.authenticate(&api_key.secret).await.unwrap();
        assert_eq!(cached.tenant.quotas.used_today, 1);

        reset_daily_quotas_and_invalidate_cache(&ctx).await.unwrap();

        let after_reset = ctx.tenant_context.authenticate(&api_key.secret).await.unwrap();
        assert_eq!(after_reset.tenant.quotas.used_today, 0, "cache must not keep serving pre-reset quota usage");
    }

    #[test]
    fn next_poll_delay_widens_with_age() {
        assert_eq!(next_poll_delay(chrono::Duration::seconds(30)), chrono::Duration::minutes(1));
        assert_eq!(next_poll_delay(chrono::Duration::minutes(3)), chrono::Duration::minutes(5));
        assert_eq!(next_poll_delay(chrono::Duration::minutes(10)), chrono::Duration::minutes(15));
        assert_eq!(next_poll_delay(chrono::Duration::hours(1)), chrono::Duration::hours(1));
        assert_eq!(next_poll_delay(chrono::Duration::hours(4)), chrono::Duration::hours(6));
        assert_eq!(next_poll_delay(chrono::Duration::days(2)), chrono::Duration::hours(24));
    }

    #[tokio::test]
    async fn poll_pending_domains_gives_up_after_seven_days() {
        let pool = memory_pool().await;
        let ctx = AppContext::build(pool.clone(), test_config()).await.unwrap();

        let tenant = ctx.tenants.create(NewTenant { name: "Acme".into(), plan: Plan::Free }).await.unwrap();
        let domain = ctx
            .domains
            .create(tenant.id, NewDomain { name: "stale.example".into(), dkim_algorithm: DkimAlgorithm::RsaSha256 })
            .await
            .unwrap();

        sqlx::query("UPDATE domains SET created_at = ? WHERE id = ?")
            .bind((chrono::Utc::now() - chrono::Duration::days(8)).to_rfc3339())
            .bind(domain.id.to_string())
            .execute(&pool)
            .await
            .unwrap();

        poll_pending_domains(&ctx).await;

        let refreshed = ctx.domains.get(tenant.id, domain.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, VerificationStatus::Failed);
    }

    #[test]
    fn original_recipients_extracts_rfc822_address_from_feedback_report() {
        let raw = b"From: feedback@isp.example\r\n\
Subject: FW: abuse report\r\n\
Content-Type: multipart/report; report-type=feedback-report; boundary=\"X\"\r\n\
\r\n\
--X\r\n\
Content-Type: text/plain\r\n\
\r\n\
This is an autogenerated abuse report.\r\n\
--X\r\n\
Content-Type: message/feedback-report\r\n\
\r\n\
Feedback-Type: abuse\r\n\
Original-Rcpt-To: rfc822;bounced-user@tenant-domain.example\r\n\
Original-Mail-From: sender@tenant-domain.example\r\n\
--X--\r\n";

        let message = mail_parser::MessageParser::default().parse(raw).expect("message parses");
        let recipients = original_recipients(&message);
        assert!(recipients.iter().any(|r| r == "bounced-user@tenant-domain.example"));
    }

    #[test]
    fn original_recipients_is_empty_when_absent() {
        let raw = b"From: a@example.com\r\nSubject: hi\r\n\r\nplain body with no report\r\n";
        let message = mail_parser::MessageParser::default().parse(raw).expect("message parses");
        assert!(original_recipients(&message).is_empty());
    }
}
