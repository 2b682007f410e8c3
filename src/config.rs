use std::{net::SocketAddr, time::Duration};

use serde::Deserialize;

/// Runtime environment: used to pick the tracing format and to relax a
/// handful of checks (self-signed certs, plaintext SMTP) during local
/// development.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        match std::env::var("ENVIRONMENT").as_deref() {
            Ok("production") => Environment::Production,
            Ok("staging") => Environment::Staging,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base: Duration,
    pub factor: f64,
    pub max_backoff: Duration,
    pub wallclock_max: Duration,
    pub max_attempts: u32,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            base: Duration::from_secs(60),
            factor: 2.0,
            max_backoff: Duration::from_secs(12 * 3600),
            wallclock_max: Duration::from_secs(48 * 3600),
            max_attempts: 10,
            jitter: 0.20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub delivery_concurrency: usize,
    pub per_recipient_domain: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            delivery_concurrency: 32,
            per_recipient_domain: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DkimConfig {
    pub fallback_domain: String,
}

/// Per-plan admission limits, plus the plan-independent scopes that protect
/// shared infrastructure (a destination mailbox provider, a single source
/// IP) rather than meter tenant usage.
#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    pub tenant_per_minute: i64,
    pub tenant_per_day: i64,
    pub domain_per_minute: i64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub free: PlanLimits,
    pub pro: PlanLimits,
    pub business: PlanLimits,
    pub recipient_domain_per_minute: i64,
    pub ip_per_minute: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            free: PlanLimits { tenant_per_minute: 10, tenant_per_day: 200, domain_per_minute: 30 },
            pro: PlanLimits { tenant_per_minute: 120, tenant_per_day: 50_000, domain_per_minute: 600 },
            business: PlanLimits { tenant_per_minute: 1_000, tenant_per_day: 1_000_000, domain_per_minute: 5_000 },
            recipient_domain_per_minute: 120,
            ip_per_minute: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// Structured configuration object, loaded once at process boot from the
/// environment. No other module reads `env::var` directly; everything
/// needed downstream is a typed field here, injected into constructors.
#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub hostname: String,
    pub api_addr: SocketAddr,
    pub mx_addr: SocketAddr,
    pub submission_addr: SocketAddr,
    pub max_message_bytes: usize,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub dkim: DkimConfig,
    pub rate_limit: RateLimitConfig,
    pub tls: TlsConfig,
    pub database_url: String,
    pub storage_backend: StorageBackend,
    pub log_level: String,
    pub session_key_material: Vec<u8>,
    pub analytics_retention_days: i64,
    pub idempotency_window_hours: i64,
    /// DNS resolvers to query for MX/TXT lookups. Defaults to Quad9's
    /// DNS-over-TLS endpoint; a deployer who wants a different upstream sets
    /// `DNS_NAMESERVERS` to a comma-separated `host:port` list.
    pub nameservers: Vec<SocketAddr>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = Environment::from_env();

        let hostname =
            std::env::var("HOSTNAME").unwrap_or_else(|_| "mail.ultrazend.example".to_string());

        let api_addr = env_socket_addr("API_ADDR", "0.0.0.0:8080")?;
        let mx_addr = env_socket_addr("MX_ADDR", "0.0.0.0:25")?;
        let submission_addr = env_socket_addr("SUBMISSION_ADDR", "0.0.0.0:587")?;

        let max_message_bytes = std::env::var("MAX_MESSAGE_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(25 * 1024 * 1024);

        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let storage_backend = match std::env::var("DB_BACKEND").as_deref() {
            Ok("sqlite") => StorageBackend::Sqlite,
            Ok("postgres") | Err(_) => StorageBackend::Postgres,
            Ok(other) => {
                return Err(ConfigError::Invalid("DB_BACKEND", other.to_string()));
            }
        };

        let fallback_domain = std::env::var("DKIM_FALLBACK_DOMAIN")
            .unwrap_or_else(|_| format!("mail.{hostname}"));

        let nameservers = match std::env::var("DNS_NAMESERVERS") {
            Ok(raw) => raw
                .split(',')
                .map(|entry| {
                    let entry = entry.trim();
                    entry.parse::<SocketAddr>().map_err(|_| ConfigError::Invalid("DNS_NAMESERVERS", entry.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => vec!["9.9.9.9:853".parse().expect("valid default nameserver address")],
        };

        let tls = TlsConfig {
            cert_path: std::env::var("TLS_CERT_PATH").unwrap_or_else(|_| "cert.pem".to_string()),
            key_path: std::env::var("TLS_KEY_PATH").unwrap_or_else(|_| "key.pem".to_string()),
        };

        let session_key_material = std::env::var("SESSION_KEY")
            .unwrap_or_else(|_| "insecure-development-session-key-change-me-32b".to_string())
            .into_bytes();

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Config {
            environment,
            hostname,
            api_addr,
            mx_addr,
            submission_addr,
            max_message_bytes,
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            dkim: DkimConfig {
                fallback_domain,
            },
            rate_limit: RateLimitConfig::default(),
            tls,
            database_url,
            storage_backend,
            log_level,
            session_key_material,
            analytics_retention_days: 30,
            idempotency_window_hours: 24,
            nameservers,
        })
    }
}

fn env_socket_addr(key: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|_| ConfigError::Invalid(key, raw))
}
