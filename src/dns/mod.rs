//! MX/TXT/A lookups with timeout/retry, and the SPF/DKIM/DMARC observation
//! checks the domain registry runs against pending and verified domains.

use base64ct::{Base64Unpadded, Encoding};
use chrono::{DateTime, Utc};
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::Resolver;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::ops::Range;
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::Config;

pub enum ResolveError {
    Dns(hickory_resolver::ResolveError),
    AllServersExhausted,
}

#[derive(Clone)]
pub struct DnsResolver {
    resolver: Resolver<TokioConnectionProvider>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerifyResultStatus {
    Success,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VerifyResult {
    pub status: VerifyResultStatus,
    pub reason: String,
    pub value: Option<String>,
}

impl VerifyResult {
    pub fn error(reason: impl Into<String>, value: Option<String>) -> Self {
        VerifyResult { status: VerifyResultStatus::Error, reason: reason.into(), value }
    }
    pub fn warning(reason: impl Into<String>, value: Option<String>) -> Self {
        VerifyResult { status: VerifyResultStatus::Warning, reason: reason.into(), value }
    }
    pub fn info(reason: impl Into<String>, value: Option<String>) -> Self {
        VerifyResult { status: VerifyResultStatus::Info, reason: reason.into(), value }
    }
    pub fn success(reason: impl Into<String>) -> Self {
        VerifyResult { status: VerifyResultStatus::Success, reason: reason.into(), value: None }
    }

    pub fn is_success(&self) -> bool {
        self.status == VerifyResultStatus::Success
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DomainVerificationStatus {
    pub timestamp: DateTime<Utc>,
    pub ownership_token: VerifyResult,
    pub dkim: VerifyResult,
    pub spf: VerifyResult,
    pub dmarc: VerifyResult,
    pub a: VerifyResult,
}

/// The exact TXT value a domain must publish at
/// `_ultrazend-verification.<domain>` to prove ownership. Shared between the
/// check here and the value the API advertises to a caller so the two can
/// never drift apart.
pub fn verification_txt_value(token: &str) -> String {
    format!("ultrazend-verification={token}")
}

/// Builds a hickory `NameServerConfig` per configured address. Port 853 is
/// taken to mean DNS-over-TLS (Quad9's listener, the shipped default); any
/// other port is treated as plain DNS, which covers the common case of a
/// deployer pointing this at an internal resolver on port 53.
fn name_server_configs(addrs: &[SocketAddr]) -> Vec<NameServerConfig> {
    addrs
        .iter()
        .map(|&socket_addr| {
            let (protocol, tls_dns_name) = if socket_addr.port() == 853 {
                (Protocol::Tls, Some("dns.quad9.net".to_string()))
            } else {
                (Protocol::Udp, None)
            };
            NameServerConfig {
                socket_addr,
                protocol,
                tls_dns_name,
                http_endpoint: None,
                trust_negative_responses: false,
                bind_addr: None,
            }
        })
        .collect()
}

impl DnsResolver {
    pub fn new(config: &Config) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(10);
        opts.attempts = 4;
        opts.negative_max_ttl = Some(Duration::from_secs(20));

        let mut resolver_config = ResolverConfig::new();
        for ns in name_server_configs(&config.nameservers) {
            resolver_config.add_name_server(ns);
        }

        Self {
            resolver: Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build(),
        }
    }

    /// Resolves the next MX host to try for `domain`, honouring an
    /// ascending-preference walk. `prio` tracks
    /// which preference band has already been tried across calls for the
    /// same delivery attempt; an empty MX set falls back to the domain's own
    /// A record per RFC 5321.
    pub async fn resolve_mail_domain(&self, domain: &str, prio: &mut Range<u32>) -> Result<(String, u16), ResolveError> {
        let fqdn = format!("{domain}{}", if domain.ends_with('.') { "" } else { "." });

        let lookup = self.resolver.mx_lookup(&fqdn).await.map_err(ResolveError::Dns)?;

        let Some(destination) = lookup
            .iter()
            .filter(|mx| prio.contains(&u32::from(mx.preference())))
            .min_by_key(|mx| mx.preference())
        else {
            return if prio.contains(&0) {
                prio.start = u32::MAX;
                Ok((fqdn, 25))
            } else {
                Err(ResolveError::AllServersExhausted)
            };
        };

        prio.start = u32::from(destination.preference()) + 1;
        debug!(mx = %destination.exchange(), "selected MX candidate");
        Ok((destination.exchange().to_utf8(), 25))
    }

    async fn singular_txt(&self, record: &str, starting_with: &str) -> Result<String, &'static str> {
        trace!(record, "requesting TXT record");
        let Ok(lookup) = self.resolver.txt_lookup(record).await else {
            return Err("could not retrieve DNS record");
        };

        let mut matches = lookup.into_iter().filter(|r| {
            r.txt_data().iter().flatten().take(starting_with.len()).eq(starting_with.as_bytes())
        });

        let Some(first) = matches.next() else {
            return Err("record unavailable");
        };
        if matches.next().is_some() {
            return Err("multiple conflicting DNS records available");
        }

        let bytes = first.txt_data().iter().flatten().copied().collect::<Vec<_>>();
        String::from_utf8(bytes).or(Err("could not decode record"))
    }

    /// Checks the ownership verification TXT record at
    /// `_ultrazend-verification.<domain>` against the token generated when
    /// the domain was created.
    pub async fn verify_ownership_token(&self, domain: &str, token: &str) -> VerifyResult {
        let record = format!("_ultrazend-verification.{}.", domain.trim_matches('.'));
        match self.singular_txt(&record, "ultrazend-verification=").await {
            Ok(value) if value == verification_txt_value(token) => VerifyResult::success("token matches"),
            Ok(value) => VerifyResult::error("token does not match", Some(value)),
            Err(reason) => VerifyResult::error(reason, None),
        }
    }

    pub async fn verify_dkim(&self, domain: &str, selector: &str, expected_pubkey_der: &[u8]) -> VerifyResult {
        let domain = domain.trim_matches('.');
        let record = format!("{selector}._domainkey.{domain}.");
        let data = match self.singular_txt(&record, "v=DKIM1").await {
            Ok(data) => data,
            Err(reason) => return VerifyResult::error(reason, None),
        };

        let Some((_, pub_field)) = data.split(';').filter_map(|f| f.trim().split_once('=')).find(|(k, _)| *k == "p") else {
            return VerifyResult::error("could not get public key from record", Some(data));
        };

        let Ok(dns_key) = Base64Unpadded::decode_vec(pub_field) else {
            return VerifyResult::error("could not decode DKIM public key", Some(data));
        };

        if dns_key == expected_pubkey_der {
            VerifyResult::success("published key matches")
        } else {
            VerifyResult::error("published key does not match", Some(data))
        }
    }

    /// SPF is observed, not enforced — reported for dashboard
    /// display only.
    pub async fn verify_spf(&self, domain: &str, expected_include: &str) -> VerifyResult {
        let domain = domain.trim_matches('.');
        let record = format!("{domain}.");
        let data = match self.singular_txt(&record, "v=spf1").await {
            Ok(data) => data,
            Err(reason) => return VerifyResult::info(reason, None),
        };

        if data == format!("v=spf1 {expected_include} -all") {
            return VerifyResult::success("correctly configured");
        }
        if !data.split(' ').any(|term| term == expected_include) {
            return VerifyResult::warning(format!("SPF record is missing \"{expected_include}\""), Some(data));
        }
        VerifyResult::info("currently configured as", Some(data))
    }

    pub async fn verify_dmarc(&self, domain: &str) -> VerifyResult {
        let domain = domain.trim_matches('.');
        let record = format!("_dmarc.{domain}.");
        let data = match self.singular_txt(&record, "v=DMARC1").await {
            Ok(data) => data,
            Err(reason) => return VerifyResult::info(reason, None),
        };
        let normalized = data.trim_end_matches(';').replace("; ", ";");
        if normalized.starts_with("v=DMARC1;p=reject") || normalized.starts_with("v=DMARC1;p=quarantine") {
            VerifyResult::success("policy enforced")
        } else {
            VerifyResult::info("currently configured as", Some(normalized))
        }
    }

    pub async fn any_a_record(&self, domain: &str) -> VerifyResult {
        let fqdn = format!("{}.", domain.trim_matches('.'));
        match self.resolver.lookup_ip(fqdn).await {
            Ok(ips) if ips.iter().next().is_some() => VerifyResult::success("available"),
            Ok(_) => VerifyResult::info("no A record set", None),
            Err(_) => VerifyResult::info("could not retrieve DNS record", None),
        }
    }

    pub async fn verify_domain(&self, domain: &str, token: &str, selector: &str, dkim_pubkey_der: &[u8], spf_include: &str) -> DomainVerificationStatus {
        DomainVerificationStatus {
            timestamp: Utc::now(),
            ownership_token: self.verify_ownership_token(domain, token).await,
            dkim: self.verify_dkim(domain, selector, dkim_pubkey_der).await,
            spf: self.verify_spf(domain, spf_include).await,
            dmarc: self.verify_dmarc(domain).await,
            a: self.any_a_record(domain).await,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verification_txt_value_matches_the_literal_checked_on_lookup() {
        assert_eq!(verification_txt_value("tok-1"), "ultrazend-verification=tok-1");
    }

    #[test]
    fn port_853_is_treated_as_dns_over_tls() {
        let configs = name_server_configs(&["9.9.9.9:853".parse().unwrap()]);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].protocol, Protocol::Tls);
        assert_eq!(configs[0].tls_dns_name.as_deref(), Some("dns.quad9.net"));
    }

    #[test]
    fn other_ports_are_treated_as_plain_dns() {
        let configs = name_server_configs(&["10.0.0.1:53".parse().unwrap()]);
        assert_eq!(configs[0].protocol, Protocol::Udp);
        assert!(configs[0].tls_dns_name.is_none());
    }

    #[test]
    fn builds_one_config_per_configured_address() {
        let addrs: Vec<SocketAddr> = vec!["9.9.9.9:853".parse().unwrap(), "1.1.1.1:53".parse().unwrap()];
        assert_eq!(name_server_configs(&addrs).len(), 2);
    }
}
