use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use sqlx::{any::AnyRow, AnyPool, Row};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::models::{Error, TenantId};
use crate::storage::row;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref, FromStr)]
pub struct ApiKeyId(Uuid);

impl ApiKeyId {
    pub fn new() -> Self {
        ApiKeyId(Uuid::new_v4())
    }
}

impl Default for ApiKeyId {
    fn default() -> Self {
        Self::new()
    }
}

/// Granted capabilities for an API key, an explicit set rather than a
/// single ordinal role — `is_at_least`-style checks become `contains`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    SendEmail,
    ReadEmail,
    ManageDomains,
    ManageWebhooks,
    ReadAnalytics,
    Admin,
}

impl Permission {
    fn as_str(&self) -> &'static str {
        match self {
            Permission::SendEmail => "send_email",
            Permission::ReadEmail => "read_email",
            Permission::ManageDomains => "manage_domains",
            Permission::ManageWebhooks => "manage_webhooks",
            Permission::ReadAnalytics => "read_analytics",
            Permission::Admin => "admin",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "send_email" => Permission::SendEmail,
            "read_email" => Permission::ReadEmail,
            "manage_domains" => Permission::ManageDomains,
            "manage_webhooks" => Permission::ManageWebhooks,
            "read_analytics" => Permission::ReadAnalytics,
            "admin" => Permission::Admin,
            _ => return None,
        })
    }

    pub fn default_set() -> BTreeSet<Permission> {
        BTreeSet::from([
            Permission::SendEmail,
            Permission::ReadEmail,
            Permission::ManageDomains,
            Permission::ManageWebhooks,
            Permission::ReadAnalytics,
        ])
    }
}

fn encode_permissions(perms: &BTreeSet<Permission>) -> String {
    perms.iter().map(Permission::as_str).collect::<Vec<_>>().join(",")
}

fn decode_permissions(raw: &str) -> BTreeSet<Permission> {
    raw.split(',').filter_map(Permission::parse).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub tenant_id: TenantId,
    pub description: String,
    /// Short public prefix shown to callers so they can identify which key
    /// is in use without ever storing the secret itself.
    pub prefix: String,
    #[serde(skip)]
    pub hash: String,
    pub permissions: BTreeSet<Permission>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission) || self.permissions.contains(&Permission::Admin)
    }
}

/// Returned exactly once, at creation time; the plaintext secret is never
/// stored or retrievable again (teacher's `CreatedApiKeyWithPassword`).
#[derive(Debug, Serialize)]
pub struct CreatedApiKey {
    pub id: ApiKeyId,
    pub prefix: String,
    pub secret: String,
    pub description: String,
    pub permissions: BTreeSet<Permission>,
}

#[derive(Debug, Deserialize)]
pub struct ApiKeyRequest {
    pub description: String,
    pub permissions: BTreeSet<Permission>,
}

fn row_to_api_key(row_: &AnyRow) -> Result<ApiKey, Error> {
    Ok(ApiKey {
        id: row::uuid(row_, "id")?.into(),
        tenant_id: row::uuid(row_, "tenant_id")?.into(),
        description: row_.try_get("description")?,
        prefix: row_.try_get("prefix")?,
        hash: row_.try_get("hash")?,
        permissions: decode_permissions(&row_.try_get::<String, _>("permissions")?),
        last_used_at: row::datetime_opt(row_, "last_used_at")?,
        revoked_at: row::datetime_opt(row_, "revoked_at")?,
        created_at: row::datetime(row_, "created_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct ApiKeyRepository {
    pool: AnyPool,
}

const PREFIX_LEN: usize = 8;
const SECRET_LEN: usize = 32;

impl ApiKeyRepository {
    pub fn new(pool: AnyPool) -> Self {
        ApiKeyRepository { pool }
    }

    pub async fn create(&self, tenant_id: TenantId, req: ApiKeyRequest) -> Result<CreatedApiKey, Error> {
        let id = ApiKeyId::new();
        let prefix = format!("uz_{}", Alphanumeric.sample_string(&mut rand::rng(), PREFIX_LEN));
        let secret = Alphanumeric.sample_string(&mut rand::rng(), SECRET_LEN);
        let full_secret = format!("{prefix}.{secret}");
        let hash = password_auth::generate_hash(full_secret.as_bytes());
        let now = row::now_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO api_keys (id, tenant_id, description, prefix, hash, permissions, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(tenant_id.to_string())
        .bind(&req.description)
        .bind(&prefix)
        .bind(&hash)
        .bind(encode_permissions(&req.permissions))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(CreatedApiKey {
            id,
            prefix,
            secret: full_secret,
            description: req.description,
            permissions: req.permissions,
        })
    }

    pub async fn list(&self, tenant_id: TenantId) -> Result<Vec<ApiKey>, Error> {
        let rows = sqlx::query("SELECT * FROM api_keys WHERE tenant_id = ? ORDER BY created_at")
            .bind(tenant_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_api_key).collect()
    }

    pub async fn revoke(&self, tenant_id: TenantId, key_id: ApiKeyId) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE api_keys SET revoked_at = ? WHERE id = ? AND tenant_id = ? AND revoked_at IS NULL",
        )
        .bind(row::now_rfc3339())
        .bind(key_id.to_string())
        .bind(tenant_id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("api key not found"));
        }
        Ok(())
    }

    /// Resolves a bearer secret of the form `<prefix>.<secret>` to its
    /// owning tenant. The prefix lets us avoid a full-table scan; the hash
    /// comparison is constant-time via `password_auth`.
    pub async fn authenticate(&self, bearer: &str) -> Result<ApiKey, Error> {
        let prefix = bearer
            .split('.')
            .next()
            .ok_or(Error::NotFound("malformed api key"))?;

        let row_ = sqlx::query("SELECT * FROM api_keys WHERE prefix = ? AND revoked_at IS NULL")
            .bind(prefix)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound("api key not found"))?;

        let key = row_to_api_key(&row_)?;

        password_auth::verify_password(bearer, &key.hash)
            .map_err(|_| Error::NotFound("api key not found"))?;

        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(row::now_rfc3339())
            .bind(key.id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(key)
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
    async fn create_and_authenticate() {
        let pool = memory_pool().await;
        let tenant = TenantRepository::new(pool.clone())
            .create(NewTenant { name: "Acme".into(), plan: Plan::Free })
            .await
            .unwrap();

        let repo = ApiKeyRepository::new(pool);
        let created = repo
            .create(tenant.id, ApiKeyRequest {
                description: "CI key".into(),
                permissions: Permission::default_set(),
            })
            .await
            .unwrap();

        let authenticated = repo.authenticate(&created.secret).await.unwrap();
        assert_eq!(authenticated.tenant_id, tenant.id);
        assert!(authenticated.has(Permission::SendEmail));

        repo.revoke(tenant.id, created.id).await.unwrap();
        assert!(repo.authenticate(&created.secret).await.is_err());
    }
}
