//! Bearer-token extraction and permission enforcement shared by every
//! handler.

use axum::http::HeaderMap;

use crate::models::{Error, Permission};
use crate::tenant_context::{AuthorizedCaller, TenantContext};

use super::error::ApiError;

/// Pulls the raw token out of an `Authorization: Bearer <token>` header.
/// A session-cookie path also exists in the wider product surface but is
/// out of scope here; this crate only speaks bearer API keys.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers.get(axum::http::header::AUTHORIZATION).ok_or(Error::Unauthenticated)?;
    let value = value.to_str().map_err(|_| Error::Unauthenticated)?;
    value.strip_prefix("Bearer ").map(str::trim).filter(|t| !t.is_empty()).ok_or(Error::Unauthenticated.into())
}

/// Authenticates the caller and checks they carry `permission`, returning
/// a plain `FORBIDDEN` on a permission mismatch rather than folding it into
/// `NOT_FOUND` — handlers behind this helper have already committed to
/// revealing that the tenant/resource exists, so there is no enumeration
/// risk left to protect against.
pub async fn authorize(
    ctx: &TenantContext,
    headers: &HeaderMap,
    permission: Permission,
) -> Result<AuthorizedCaller, ApiError> {
    let token = bearer_token(headers)?;
    let caller = ctx.authenticate(token).await?;
    caller.require(permission)?;
    Ok(caller)
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::http::HeaderValue;
    use std::collections::BTreeSet;

    use crate::models::{ApiKeyRepository, ApiKeyRequest, NewTenant, Plan, TenantRepository};

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
        headers
    }

    #[test]
    fn missing_header_is_unauthenticated() {
        let headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn non_bearer_scheme_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn blank_token_after_bearer_is_rejected() {
        let headers = headers_with_bearer("   ");
        assert!(bearer_token(&headers).is_err());
    }

    #[test]
    fn extracts_token_from_valid_header() {
        let headers = headers_with_bearer("sk_live_abc123");
        assert_eq!(bearer_token(&headers).unwrap(), "sk_live_abc123");
    }

    async fn memory_pool() -> sqlx::AnyPool {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn authorize_rejects_missing_permission_as_forbidden_not_not_found() {
        let pool = memory_pool().await;
        let tenants = TenantRepository::new(pool.clone());
        let tenant = tenants.create(NewTenant { name: "Acme".into(), plan: Plan::Free }).await.unwrap();

        let api_keys = ApiKeyRepository::new(pool.clone());
        let created = api_keys
            .create(
                tenant.id,
                ApiKeyRequest { description: "ci".into(), permissions: BTreeSet::from([Permission::SendEmail]) },
            )
            .await
            .unwrap();

        let ctx = TenantContext::new(tenants, api_keys);
        let headers = headers_with_bearer(&created.secret);

        let err = authorize(&ctx, &headers, Permission::ManageDomains).await.unwrap_err();
        assert!(matches!(err, ApiError::Model(Error::Forbidden)));

        let ok = authorize(&ctx, &headers, Permission::SendEmail).await.unwrap();
        assert_eq!(ok.tenant.id, tenant.id);
    }
}
