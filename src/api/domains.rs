//! Sending-domain registration and verification.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use base64ct::{Base64, Encoding};
use serde::Serialize;

use crate::dns::{verification_txt_value, DomainVerificationStatus};
use crate::models::{Domain, DomainId, Error, NewDomain, Permission, VerificationStatus};

use super::auth::authorize;
use super::error::ApiError;
use super::ApiState;

pub async fn create(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<NewDomain>,
) -> Result<(StatusCode, Json<Domain>), ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::ManageDomains).await?;
    let domain = state.domains.create(caller.tenant.id, body).await?;
    Ok((StatusCode::CREATED, Json(domain)))
}

pub async fn list(State(state): State<ApiState>, headers: HeaderMap) -> Result<Json<Vec<Domain>>, ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::ManageDomains).await?;
    let domains = state.domains.list(caller.tenant.id).await?;
    Ok(Json(domains))
}

pub async fn get(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<DomainId>,
) -> Result<Json<Domain>, ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::ManageDomains).await?;
    let domain = state.domains.get(caller.tenant.id, id).await?.ok_or(Error::NotFound("domain not found"))?;
    Ok(Json(domain))
}

pub async fn remove(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<DomainId>,
) -> Result<StatusCode, ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::ManageDomains).await?;
    state.domains.remove(caller.tenant.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /domains/{id}/verify`. Runs the SPF/DKIM/DMARC/A checks against
/// the domain's published DNS records and records the outcome. Verification
/// only gates on ownership-token and DKIM; SPF and DMARC are reported in the
/// response for dashboard visibility but never block a `Verified` status —
/// the outbound path is already authenticated by DKIM regardless of whether
/// the tenant has a DMARC policy published.
pub async fn verify(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<DomainId>,
) -> Result<Json<DomainVerificationStatus>, ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::ManageDomains).await?;
    let domain = state.domains.get(caller.tenant.id, id).await?.ok_or(Error::NotFound("domain not found"))?;
    let (info, _key) = state.domains.active_dkim_key(domain.id).await?;
    let pubkey_der = Base64::decode_vec(&info.public_key_base64)
        .map_err(|e| Error::Internal(format!("invalid stored dkim key: {e}")))?;

    let result = state
        .dns
        .verify_domain(&domain.name, &domain.verification_token, &info.selector, &pubkey_der, &state.config.dkim.fallback_domain)
        .await;

    let status = if result.ownership_token.is_success() && result.dkim.is_success() {
        VerificationStatus::Verified
    } else {
        VerificationStatus::Failed
    };
    state.domains.mark_checked(domain.id, status).await?;

    Ok(Json(result))
}

#[derive(Debug, Serialize)]
pub struct DnsConfigResponse {
    verification_token: String,
    verification_record: String,
    dkim_selector: String,
    dkim_record_name: String,
    dkim_record_value: String,
    spf_hint: String,
}

/// `GET /domains/{id}/dns`. The DKIM `k=` tag vocabulary on the wire
/// (`rsa`/`ed25519`) differs from the storage encoding (`rsa_sha256`/
/// `ed25519`), so this maps locally rather than reusing the model's
/// internal representation.
pub async fn dns_config(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<DomainId>,
) -> Result<Json<DnsConfigResponse>, ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::ManageDomains).await?;
    let domain = state.domains.get(caller.tenant.id, id).await?.ok_or(Error::NotFound("domain not found"))?;
    let (info, _key) = state.domains.active_dkim_key(domain.id).await?;
    let k_tag = dkim_k_tag(info.algorithm);

    Ok(Json(DnsConfigResponse {
        verification_token: domain.verification_token.clone(),
        verification_record: verification_txt_value(&domain.verification_token),
        dkim_selector: info.selector.clone(),
        dkim_record_name: format!("{}._domainkey.{}", info.selector, domain.name),
        dkim_record_value: format!("v=DKIM1; k={k_tag}; p={}", info.public_key_base64),
        spf_hint: format!("v=spf1 include:{} ~all", state.config.dkim.fallback_domain),
    }))
}

/// The DKIM `k=` tag as published in DNS, distinct from the model's own
/// `DkimAlgorithm` storage encoding.
fn dkim_k_tag(algorithm: crate::models::DkimAlgorithm) -> &'static str {
    match algorithm {
        crate::models::DkimAlgorithm::RsaSha256 => "rsa",
        crate::models::DkimAlgorithm::Ed25519 => "ed25519",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::DkimAlgorithm;

    #[test]
    fn k_tag_uses_dns_vocabulary_not_storage_encoding() {
        assert_eq!(dkim_k_tag(DkimAlgorithm::RsaSha256), "rsa");
        assert_eq!(dkim_k_tag(DkimAlgorithm::Ed25519), "ed25519");
    }

    #[test]
    fn advertised_txt_record_matches_what_verification_checks_for() {
        let advertised = verification_txt_value("abc123");
        assert_eq!(advertised, "ultrazend-verification=abc123");
    }
}
