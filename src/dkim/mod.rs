//! Per-domain DKIM signing and fallback-domain selection.

use mail_auth::common::headers::HeaderWriter;
use mail_auth::dkim::DkimSigner;

use crate::config::Config;
use crate::models::{Domain, DomainId, DomainRepository, Error, TenantId, VerificationStatus};

const SIGNED_HEADERS: [&str; 26] = [
    "From",
    "Subject",
    "Date",
    "Message-ID",
    "To",
    "Cc",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
    "Content-ID",
    "Content-Description",
    "Resent-Date",
    "Resent-From",
    "Resent-Sender",
    "Resent-To",
    "Resent-Cc",
    "Resent-Message-ID",
    "In-Reply-To",
    "References",
    "List-Id",
    "List-Help",
    "List-Unsubscribe",
    "List-Subscribe",
    "List-Post",
    "List-Owner",
    "List-Archive",
];

/// The domain identity a message was actually signed under, and whether
/// that required falling back off the envelope sender's own domain.
pub struct SigningOutcome {
    pub domain_used: String,
    pub selector_used: String,
    pub fallback_used: bool,
    pub dkim_signature_header: String,
}

#[derive(Clone)]
pub struct DkimEngine {
    domains: DomainRepository,
    fallback_domain: String,
    fallback_selector: String,
}

impl DkimEngine {
    /// `fallback_domain_id`/`fallback_selector` identify the system-owned
    /// domain row that is always treated as verified, regardless of its actual verification state.
    pub fn new(domains: DomainRepository, config: &Config, fallback_selector: String) -> Self {
        DkimEngine { domains, fallback_domain: config.dkim.fallback_domain.clone(), fallback_selector }
    }

    /// Resolves which domain identity to sign `envelope_from`'s domain with.
    /// Returns the `Domain` row to sign under (the sender's own domain, which
    /// may or may not be verified yet, or `None` if the fallback applies)
    /// plus whether the fallback was used. A domain the tenant owns but
    /// hasn't verified is still returned here rather than silently falling
    /// back — the caller (`Pipeline::submit`) is the one that decides
    /// whether an unverified owned domain should reject the send.
    pub async fn resolve_signing_domain(&self, tenant_id: TenantId, sender_domain: &str) -> Result<(Option<Domain>, bool), Error> {
        match self.domains.find_by_name(sender_domain).await? {
            Some(domain) if domain.tenant_id == tenant_id => Ok((Some(domain), false)),
            _ => Ok((None, true)),
        }
    }

    /// Signs `message` with the sender's own key, or with the fallback
    /// domain's key when `fallback_used` is set. `fallback_domain_id` must
    /// be the system tenant's fallback `Domain` row id.
    pub async fn sign(
        &self,
        domain: Option<&Domain>,
        fallback_domain_id: DomainId,
        message: &mail_parser::Message<'_>,
    ) -> Result<SigningOutcome, Error> {
        let (domain_used, selector_used, domain_id, fallback_used) = match domain {
            Some(d) => (d.name.clone(), d.dkim_selector.clone(), d.id, false),
            None => (self.fallback_domain.clone(), self.fallback_selector.clone(), fallback_domain_id, true),
        };

        let (_, key) = self.domains.active_dkim_key(domain_id).await?;
        let signing_key = key.signing_key()?;

        let header = sign_with_key(&signing_key, &domain_used, &selector_used, message)?;

        Ok(SigningOutcome { domain_used, selector_used, fallback_used, dkim_signature_header: header })
    }
}

fn sign_with_key(
    key: &crate::models::MailAuthSigningKey,
    domain: &str,
    selector: &str,
    message: &mail_parser::Message<'_>,
) -> Result<String, Error> {
    let signer = DkimSigner::from_key(key).domain(domain).selector(selector).headers(SIGNED_HEADERS);
    let signature = signer.sign(&message.raw_message)?;
    Ok(signature.to_header())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{DkimAlgorithm, NewDomain, NewTenant, Plan, TenantRepository};

    async fn memory_pool() -> sqlx::AnyPool {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn owned_unverified_sender_is_resolved_not_fallen_back() {
        let pool = memory_pool().await;
        let tenants = TenantRepository::new(pool.clone());
        let tenant = tenants.create(NewTenant { name: "Acme".into(), plan: Plan::Free }).await.unwrap();

        let domains = DomainRepository::new(pool.clone());
        let sender = domains
            .create(tenant.id, NewDomain { name: "unverified.example".into(), dkim_algorithm: DkimAlgorithm::Ed25519 })
            .await
            .unwrap();

        let engine = DkimEngine {
            domains: domains.clone(),
            fallback_domain: "mail.ultrazend.example".into(),
            fallback_selector: "uzfallback".into(),
        };

        // The caller owns this domain, just hasn't verified it yet — it must
        // come back as the resolved domain (not a silent fallback) so
        // `Pipeline::submit` can reject the send with `DOMAIN_NOT_VERIFIED`.
        let (resolved, fallback_used) = engine.resolve_signing_domain(tenant.id, &sender.name).await.unwrap();
        assert_eq!(resolved.as_ref().unwrap().id, sender.id);
        assert_eq!(resolved.as_ref().unwrap().status, VerificationStatus::Pending);
        assert!(!fallback_used);
    }

    #[tokio::test]
    async fn unowned_sender_domain_falls_back() {
        let pool = memory_pool().await;
        let tenants = TenantRepository::new(pool.clone());
        let owner = tenants.create(NewTenant { name: "Acme".into(), plan: Plan::Free }).await.unwrap();
        let other = tenants.create(NewTenant { name: "Other".into(), plan: Plan::Free }).await.unwrap();

        let domains = DomainRepository::new(pool.clone());
        let sender = domains
            .create(owner.id, NewDomain { name: "someone-elses.example".into(), dkim_algorithm: DkimAlgorithm::Ed25519 })
            .await
            .unwrap();

        let fallback = domains
            .create(owner.id, NewDomain { name: "mail.ultrazend.example".into(), dkim_algorithm: DkimAlgorithm::Ed25519 })
            .await
            .unwrap();

        let engine = DkimEngine { domains: domains.clone(), fallback_domain: fallback.name.clone(), fallback_selector: fallback.dkim_selector.clone() };

        // `other` never registered `someone-elses.example`, so signing for it
        // falls back rather than borrowing another tenant's domain identity.
        let (resolved, fallback_used) = engine.resolve_signing_domain(other.id, &sender.name).await.unwrap();
        assert!(resolved.is_none());
        assert!(fallback_used);

        let raw = b"From: alerts@someone-elses.example\r\nTo: ops@example.net\r\nSubject: hi\r\n\r\nbody".to_vec();
        let message = mail_parser::MessageParser::default().parse(&raw).unwrap();

        let outcome = engine.sign(resolved.as_ref(), fallback.id, &message).await.unwrap();
        assert!(outcome.fallback_used);
        assert_eq!(outcome.domain_used, fallback.name);
        assert!(outcome.dkim_signature_header.contains(&format!("d={}", fallback.name)));
    }

    #[tokio::test]
    async fn verified_sender_signs_own_domain() {
        let pool = memory_pool().await;
        let tenants = TenantRepository::new(pool.clone());
        let tenant = tenants.create(NewTenant { name: "Acme".into(), plan: Plan::Free }).await.unwrap();

        let domains = DomainRepository::new(pool.clone());
        let sender = domains
            .create(tenant.id, NewDomain { name: "verified.example".into(), dkim_algorithm: DkimAlgorithm::RsaSha256 })
            .await
            .unwrap();
        domains.mark_checked(sender.id, VerificationStatus::Verified).await.unwrap();
        let sender = domains.get(tenant.id, sender.id).await.unwrap().unwrap();

        let engine = DkimEngine { domains: domains.clone(), fallback_domain: "mail.ultrazend.example".into(), fallback_selector: "uzfallback".into() };

        let (resolved, fallback_used) = engine.resolve_signing_domain(tenant.id, &sender.name).await.unwrap();
        assert!(!fallback_used);
        assert_eq!(resolved.as_ref().unwrap().id, sender.id);
    }
}
