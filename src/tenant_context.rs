//! TTL-cached tenant resolution and per-request authorization.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::models::{ApiKey, ApiKeyRepository, Error, Permission, Tenant, TenantId, TenantRepository};

const CACHE_TTL: Duration = Duration::from_secs(30);

struct CachedTenant {
    tenant: Tenant,
    fetched_at: Instant,
}

/// A resolved caller: the tenant they belong to and the API key used to
/// authenticate, already permission-checked for the calling endpoint.
#[derive(Debug, Clone)]
pub struct AuthorizedCaller {
    pub tenant: Tenant,
    pub api_key: ApiKey,
}

impl AuthorizedCaller {
    /// Checks a capability the route itself decides it needs, distinct from
    /// `TenantContext::authorize`'s folded-into-`NotFound` behavior: a
    /// handler that already resolved a caller wants a plain `FORBIDDEN`, not
    /// a tenant-enumeration-safe 404.
    pub fn require(&self, permission: Permission) -> Result<(), Error> {
        if self.api_key.has(permission) {
            Ok(())
        } else {
            Err(Error::Forbidden)
        }
    }
}

/// Resolves bearer tokens to tenants, with a short TTL cache so a hot path
/// (e.g. `POST /emails`) doesn't hit the tenants table on every call. The
/// API key lookup itself is never cached (it gates authentication and must
/// see `revoked_at` immediately).
#[derive(Clone)]
pub struct TenantContext {
    tenants: TenantRepository,
    api_keys: ApiKeyRepository,
    cache: Arc<RwLock<HashMap<TenantId, CachedTenant>>>,
}

impl TenantContext {
    pub fn new(tenants: TenantRepository, api_keys: ApiKeyRepository) -> Self {
        TenantContext { tenants, api_keys, cache: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Authenticates `bearer` and checks it carries `required`. Returns
    /// `Error::NotFound` rather than a distinct "forbidden" variant so
    /// callers can't use permission errors to enumerate tenants.
    pub async fn authorize(&self, bearer: &str, required: Permission) -> Result<AuthorizedCaller, Error> {
        let api_key = self.api_keys.authenticate(bearer).await.map_err(|_| Error::NotFound("invalid API key"))?;
        if !api_key.has(required) {
            return Err(Error::NotFound("invalid API key"));
        }
        let tenant = self.tenant(api_key.tenant_id).await?;
        Ok(AuthorizedCaller { tenant, api_key })
    }

    /// Authenticates `bearer` without checking any particular capability,
    /// for handlers that call `AuthorizedCaller::require` themselves once
    /// they know which permission the route needs.
    pub async fn authenticate(&self, bearer: &str) -> Result<AuthorizedCaller, Error> {
        let api_key = self.api_keys.authenticate(bearer).await.map_err(|_| Error::Unauthenticated)?;
        let tenant = self.tenant(api_key.tenant_id).await?;
        Ok(AuthorizedCaller { tenant, api_key })
    }

    async fn tenant(&self, id: TenantId) -> Result<Tenant, Error> {
        if let Some(cached) = self.cache.read().await.get(&id) {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                return Ok(cached.tenant.clone());
            }
        }

        let tenant = self.tenants.get(id).await?.ok_or(Error::NotFound("tenant not found"))?;
        self.cache.write().await.insert(id, CachedTenant { tenant: tenant.clone(), fetched_at: Instant::now() });
        Ok(tenant)
    }

    pub async fn invalidate(&self, id: TenantId) {
        self.cache.write().await.remove(&id);
    }
}

/// Enforces that a query result carries only rows belonging to `tenant_id`
///. Every repository method that lists/gets rows
/// already filters by `tenant_id` at the SQL level; this is the defense in
/// depth check used by cross-tenant-sensitive handlers that assemble
/// results from more than one repository call.
pub fn assert_owned<T>(tenant_id: TenantId, owner: TenantId, value: T) -> Result<T, Error> {
    if owner == tenant_id {
        Ok(value)
    } else {
        Err(Error::CrossTenant)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{NewTenant, Plan};

    async fn memory_pool() -> sqlx::AnyPool {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn authorize_checks_permission() {
        let pool = memory_pool().await;
        let tenants = TenantRepository::new(pool.clone());
        let tenant = tenants.create(NewTenant { name: "Acme".into(), plan: Plan::Free }).await.unwrap();

        let api_keys = ApiKeyRepository::new(pool.clone());
        let created = api_keys
            .create(
                tenant.id,
                crate::models::ApiKeyRequest {
                    description: "ci".into(),
                    permissions: std::collections::BTreeSet::from([Permission::SendEmail]),
                },
            )
            .await
            .unwrap();

        let ctx = TenantContext::new(tenants, api_keys);
        let bearer = created.secret.clone();

        let authorized = ctx.authorize(&bearer, Permission::SendEmail).await.unwrap();
        assert_eq!(authorized.tenant.id, tenant.id);

        assert!(ctx.authorize(&bearer, Permission::ManageDomains).await.is_err());
    }
}
