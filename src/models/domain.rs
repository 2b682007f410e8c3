use aws_lc_rs::{encoding::AsDer, rsa::KeySize, signature::KeyPair};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use mail_auth::common::{crypto::Algorithm, headers::Writable};
use mail_send::mail_auth::common::crypto as mail_auth_crypto;
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, AnyPool, Row};
use std::fmt::{Debug, Formatter};
use uuid::Uuid;

use crate::models::{Error, TenantId};
use crate::storage::row;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr)]
pub struct DomainId(Uuid);

impl DomainId {
    pub fn new() -> Self {
        DomainId(Uuid::new_v4())
    }
}

impl Default for DomainId {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the domain through its verification lifecycle:
/// newly-added domains start `Pending`, become `Verified` once SPF/DKIM/
/// DMARC checks pass, and move to `Failed` after repeated check failures
/// without ever blocking creation of the domain record itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Failed,
}

impl VerificationStatus {
    fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(VerificationStatus::Pending),
            "verified" => Ok(VerificationStatus::Verified),
            "failed" => Ok(VerificationStatus::Failed),
            other => Err(Error::Internal(format!("unknown verification status {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DkimAlgorithm {
    RsaSha256,
    Ed25519,
}

impl DkimAlgorithm {
    fn as_str(&self) -> &'static str {
        match self {
            DkimAlgorithm::RsaSha256 => "rsa_sha256",
            DkimAlgorithm::Ed25519 => "ed25519",
        }
    }

    fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "rsa_sha256" => Ok(DkimAlgorithm::RsaSha256),
            "ed25519" => Ok(DkimAlgorithm::Ed25519),
            other => Err(Error::Internal(format!("unknown dkim algorithm {other}"))),
        }
    }
}

/// Holds actual key material; never serialized. Reconstructed from the
/// PKCS8 DER stored in `dkim_keys.private_key_der`.
pub enum DkimKey {
    Ed25519(aws_lc_rs::signature::Ed25519KeyPair),
    RsaSha256(aws_lc_rs::rsa::KeyPair),
}

impl Debug for DkimKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DkimKey::Ed25519(_) => write!(f, "DkimKey::Ed25519"),
            DkimKey::RsaSha256(_) => write!(f, "DkimKey::RsaSha256"),
        }
    }
}

impl DkimKey {
    fn generate(algorithm: DkimAlgorithm) -> Result<Vec<u8>, Error> {
        let der = match algorithm {
            DkimAlgorithm::RsaSha256 => aws_lc_rs::rsa::KeyPair::generate(KeySize::Rsa2048)?.as_der()?.as_ref().to_vec(),
            DkimAlgorithm::Ed25519 => aws_lc_rs::signature::Ed25519KeyPair::generate()?.as_der()?.as_ref().to_vec(),
        };
        Ok(der)
    }

    fn from_pkcs8(algorithm: DkimAlgorithm, der: &[u8]) -> Result<Self, Error> {
        Ok(match algorithm {
            DkimAlgorithm::RsaSha256 => DkimKey::RsaSha256(aws_lc_rs::rsa::KeyPair::from_pkcs8(der)?),
            DkimAlgorithm::Ed25519 => DkimKey::Ed25519(aws_lc_rs::signature::Ed25519KeyPair::from_pkcs8(der)?),
        })
    }

    pub fn public_key_base64(&self) -> Result<String, Error> {
        let der = match self {
            DkimKey::Ed25519(k) => k.public_key().as_der()?.as_ref().to_vec(),
            DkimKey::RsaSha256(k) => k.public_key().as_der()?.as_ref().to_vec(),
        };
        Ok(Base64::encode_string(&der))
    }

    pub fn signing_key(&self) -> Result<MailAuthSigningKey, Error> {
        match self {
            DkimKey::Ed25519(k) => Ok(MailAuthSigningKey::Ed25519(
                mail_auth_crypto::Ed25519Key::from_pkcs8_der(k.to_pkcs8()?.as_ref())?,
            )),
            DkimKey::RsaSha256(k) => Ok(MailAuthSigningKey::RsaSha256(
                mail_auth_crypto::RsaKey::<mail_auth_crypto::Sha256>::from_pkcs8_der(k.as_der()?.as_ref())?,
            )),
        }
    }
}

pub enum MailAuthSigningKey {
    Ed25519(mail_auth_crypto::Ed25519Key),
    RsaSha256(mail_auth_crypto::RsaKey<mail_auth_crypto::Sha256>),
}

impl mail_auth_crypto::SigningKey for MailAuthSigningKey {
    type Hasher = mail_auth_crypto::Sha256;

    fn sign(&self, input: impl Writable) -> mail_auth::Result<Vec<u8>> {
        match self {
            MailAuthSigningKey::Ed25519(k) => k.sign(input),
            MailAuthSigningKey::RsaSha256(k) => k.sign(input),
        }
    }

    fn algorithm(&self) -> Algorithm {
        match self {
            MailAuthSigningKey::Ed25519(k) => k.algorithm(),
            MailAuthSigningKey::RsaSha256(k) => k.algorithm(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Domain {
    pub id: DomainId,
    pub tenant_id: TenantId,
    pub name: String,
    pub status: VerificationStatus,
    pub verification_token: String,
    pub dkim_selector: String,
    pub verified_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Public view of a domain's current DKIM key, safe to hand back to callers
/// asking how to configure DNS.
#[derive(Debug, Serialize)]
pub struct DkimKeyInfo {
    pub selector: String,
    pub algorithm: DkimAlgorithm,
    pub public_key_base64: String,
}

#[derive(Debug, Deserialize)]
pub struct NewDomain {
    pub name: String,
    #[serde(default = "default_algorithm")]
    pub dkim_algorithm: DkimAlgorithm,
}

fn default_algorithm() -> DkimAlgorithm {
    DkimAlgorithm::RsaSha256
}

fn default_selector() -> String {
    format!("uz{}", Alphanumeric.sample_string(&mut rand::rng(), 6)).to_lowercase()
}

/// The rotation selector convention: `sYYYYMM`, so a domain's DNS history
/// shows at a glance which month each key was cut over.
fn rotation_selector(now: DateTime<Utc>) -> String {
    format!("s{}", now.format("%Y%m"))
}

fn domain_from_row(row_: &AnyRow) -> Result<Domain, Error> {
    Ok(Domain {
        id: row::uuid(row_, "id")?.into(),
        tenant_id: row::uuid(row_, "tenant_id")?.into(),
        name: row_.try_get("name")?,
        status: VerificationStatus::parse(&row_.try_get::<String, _>("status")?)?,
        verification_token: row_.try_get("verification_token")?,
        dkim_selector: row_.try_get("dkim_selector")?,
        verified_at: row::datetime_opt(row_, "verified_at")?,
        last_checked_at: row::datetime_opt(row_, "last_checked_at")?,
        created_at: row::datetime(row_, "created_at")?,
        updated_at: row::datetime(row_, "updated_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct DomainRepository {
    pool: AnyPool,
}

impl DomainRepository {
    pub fn new(pool: AnyPool) -> Self {
        DomainRepository { pool }
    }

    pub async fn create(&self, tenant_id: TenantId, new: NewDomain) -> Result<Domain, Error> {
        let id = DomainId::new();
        let now = row::now_rfc3339();
        let token = Alphanumeric.sample_string(&mut rand::rng(), 32);
        let selector = default_selector();
        let der = DkimKey::generate(new.dkim_algorithm)?;

        sqlx::query(
            r#"
            INSERT INTO domains (id, tenant_id, name, status, verification_token, dkim_selector, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .bind(&new.name)
        .bind(&token)
        .bind(&selector)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO dkim_keys (domain_id, selector, algorithm, private_key_der, created_at, active)
            VALUES (?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(id.to_string())
        .bind(&selector)
        .bind(new.dkim_algorithm.as_str())
        .bind(Base64::encode_string(&der))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(tenant_id, id).await?.ok_or(Error::NotFound("domain not found after insert"))
    }

    pub async fn get(&self, tenant_id: TenantId, id: DomainId) -> Result<Option<Domain>, Error> {
        let row_ = sqlx::query("SELECT * FROM domains WHERE id = ? AND tenant_id = ?")
            .bind(id.to_string())
            .bind(tenant_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row_.as_ref().map(domain_from_row).transpose()
    }

    /// Looks a domain up by name regardless of tenant, used to resolve
    /// the sending domain of an outbound email.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<Domain>, Error> {
        let row_ = sqlx::query("SELECT * FROM domains WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row_.as_ref().map(domain_from_row).transpose()
    }

    /// All domains still awaiting verification, across every tenant — used
    /// by the periodic poller, which isn't scoped to a single caller.
    pub async fn list_pending(&self) -> Result<Vec<Domain>, Error> {
        let rows = sqlx::query("SELECT * FROM domains WHERE status = 'pending'").fetch_all(&self.pool).await?;
        rows.iter().map(domain_from_row).collect()
    }

    pub async fn list(&self, tenant_id: TenantId) -> Result<Vec<Domain>, Error> {
        let rows = sqlx::query("SELECT * FROM domains WHERE tenant_id = ? ORDER BY created_at")
            .bind(tenant_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(domain_from_row).collect()
    }

    pub async fn remove(&self, tenant_id: TenantId, id: DomainId) -> Result<(), Error> {
        let result = sqlx::query("DELETE FROM domains WHERE id = ? AND tenant_id = ?")
            .bind(id.to_string())
            .bind(tenant_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("domain not found"));
        }
        Ok(())
    }

    pub async fn mark_checked(&self, id: DomainId, status: VerificationStatus) -> Result<(), Error> {
        let now = row::now_rfc3339();
        let verified_at_clause = matches!(status, VerificationStatus::Verified).then(|| now.clone());

        sqlx::query(
            r#"
            UPDATE domains
            SET status = ?, last_checked_at = ?, updated_at = ?,
                verified_at = COALESCE(?, verified_at)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(&now)
        .bind(&now)
        .bind(verified_at_clause)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Loads the active signing key for a domain, used by the DKIM signer
    /// right before a message leaves the outbound transport.
    pub async fn active_dkim_key(&self, domain_id: DomainId) -> Result<(DkimKeyInfo, DkimKey), Error> {
        let row_ = sqlx::query("SELECT * FROM dkim_keys WHERE domain_id = ? AND active = 1")
            .bind(domain_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("no active dkim key for domain"))?;

        let selector: String = row_.try_get("selector")?;
        let algorithm = DkimAlgorithm::parse(&row_.try_get::<String, _>("algorithm")?)?;
        let der_base64: String = row_.try_get("private_key_der")?;
        let der = Base64::decode_vec(&der_base64).map_err(|e| Error::Internal(format!("invalid dkim key encoding: {e}")))?;
        let key = DkimKey::from_pkcs8(algorithm, &der)?;

        let info = DkimKeyInfo {
            selector,
            algorithm,
            public_key_base64: key.public_key_base64()?,
        };

        Ok((info, key))
    }

    /// Mints a fresh keypair under the `sYYYYMM` selector and makes it the
    /// active signing key, retiring (but not deleting) the previous one —
    /// `dkim_keys` rows never disappear on rotation, so a DNS record a
    /// receiver cached for the old selector still resolves during the
    /// overlap window.
    pub async fn rotate_key(&self, tenant_id: TenantId, id: DomainId) -> Result<DkimKeyInfo, Error> {
        self.get(tenant_id, id).await?.ok_or(Error::NotFound("domain not found"))?;
        let (current, _) = self.active_dkim_key(id).await?;

        let now = row::now_rfc3339();
        let selector = rotation_selector(Utc::now());
        let der = DkimKey::generate(current.algorithm)?;

        sqlx::query("UPDATE dkim_keys SET active = 0 WHERE domain_id = ? AND active = 1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO dkim_keys (domain_id, selector, algorithm, private_key_der, created_at, active)
            VALUES (?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(id.to_string())
        .bind(&selector)
        .bind(current.algorithm.as_str())
        .bind(Base64::encode_string(&der))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE domains SET dkim_selector = ?, updated_at = ? WHERE id = ?")
            .bind(&selector)
            .bind(&now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        let (info, _) = self.active_dkim_key(id).await?;
        Ok(info)
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
    async fn create_and_verify() {
        let pool = memory_pool().await;
        let tenant = TenantRepository::new(pool.clone())
            .create(NewTenant { name: "Acme".into(), plan: Plan::Free })
            .await
            .unwrap();

        let repo = DomainRepository::new(pool);
        let domain = repo
            .create(tenant.id, NewDomain { name: "example.com".into(), dkim_algorithm: DkimAlgorithm::RsaSha256 })
            .await
            .unwrap();
        assert_eq!(domain.status, VerificationStatus::Pending);

        let (info, key) = repo.active_dkim_key(domain.id).await.unwrap();
        assert_eq!(info.selector, domain.dkim_selector);
        assert!(key.signing_key().is_ok());

        repo.mark_checked(domain.id, VerificationStatus::Verified).await.unwrap();
        let refreshed = repo.get(tenant.id, domain.id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, VerificationStatus::Verified);
        assert!(refreshed.verified_at.is_some());
    }

    #[tokio::test]
    async fn rotate_key_activates_new_selector_and_retains_old_one() {
        let pool = memory_pool().await;
        let tenant = TenantRepository::new(pool.clone())
            .create(NewTenant { name: "Acme".into(), plan: Plan::Free })
            .await
            .unwrap();

        let repo = DomainRepository::new(pool.clone());
        let domain = repo
            .create(tenant.id, NewDomain { name: "rotates.example".into(), dkim_algorithm: DkimAlgorithm::RsaSha256 })
            .await
            .unwrap();
        let original_selector = domain.dkim_selector.clone();

        let rotated = repo.rotate_key(tenant.id, domain.id).await.unwrap();
        assert_ne!(rotated.selector, original_selector);
        assert!(rotated.selector.starts_with('s') && rotated.selector.len() == 7);

        let refreshed = repo.get(tenant.id, domain.id).await.unwrap().unwrap();
        assert_eq!(refreshed.dkim_selector, rotated.selector);

        let (active_info, _) = repo.active_dkim_key(domain.id).await.unwrap();
        assert_eq!(active_info.selector, rotated.selector);

        let old_row = sqlx::query("SELECT active FROM dkim_keys WHERE domain_id = ? AND selector = ?")
            .bind(domain.id.to_string())
            .bind(&original_selector)
            .fetch_one(&pool)
            .await
            .unwrap();
        let active: i64 = old_row.try_get("active").unwrap();
        assert_eq!(active, 0, "retired key must still be present, just inactive");
    }

    #[tokio::test]
    async fn list_pending_excludes_verified_domains() {
        let pool = memory_pool().await;
        let tenant = TenantRepository::new(pool.clone())
            .create(NewTenant { name: "Acme".into(), plan: Plan::Free })
            .await
            .unwrap();

        let repo = DomainRepository::new(pool);
        let pending = repo
            .create(tenant.id, NewDomain { name: "pending.example".into(), dkim_algorithm: DkimAlgorithm::RsaSha256 })
            .await
            .unwrap();
        let verified = repo
            .create(tenant.id, NewDomain { name: "verified.example".into(), dkim_algorithm: DkimAlgorithm::RsaSha256 })
            .await
            .unwrap();
        repo.mark_checked(verified.id, VerificationStatus::Verified).await.unwrap();

        let due = repo.list_pending().await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, pending.id);
    }

    #[tokio::test]
    async fn cross_tenant_lookup_fails() {
        let pool = memory_pool().await;
        let tenants = TenantRepository::new(pool.clone());
        let tenant_a = tenants.create(NewTenant { name: "A".into(), plan: Plan::Free }).await.unwrap();
        let tenant_b = tenants.create(NewTenant { name: "B".into(), plan: Plan::Free }).await.unwrap();

        let repo = DomainRepository::new(pool);
        let domain = repo
            .create(tenant_a.id, NewDomain { name: "a.example".into(), dkim_algorithm: DkimAlgorithm::Ed25519 })
            .await
            .unwrap();

        assert!(repo.get(tenant_b.id, domain.id).await.unwrap().is_none());
    }
}
