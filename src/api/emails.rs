//! `POST /emails`, `POST /emails/batch`, `GET /emails/{id}`, `GET /emails`.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::models::{Email, EmailId, Error, NewEmail, Permission};

use super::auth::authorize;
use super::error::ApiError;
use super::ApiState;

const BATCH_MAX: usize = 100;
const IDEMPOTENCY_HEADER: &str = "idempotency-key";

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers.get(IDEMPOTENCY_HEADER).and_then(|v| v.to_str().ok()).map(str::to_owned)
}

/// `POST /emails`. Returns `202 Accepted` on admission; the email may still
/// fail delivery later.
pub async fn create(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<NewEmail>,
) -> Result<(StatusCode, Json<Email>), ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::SendEmail).await?;
    let key = idempotency_key(&headers);

    if let Some(key) = &key {
        if let Some(existing) =
            state.emails.find_by_idempotency_key(caller.tenant.id, key, state.idempotency_window).await?
        {
            return Ok((StatusCode::ACCEPTED, Json(existing)));
        }
    }

    let email = state.pipeline.submit(caller.tenant.id, body, addr.ip(), key).await?;
    Ok((StatusCode::ACCEPTED, Json(email)))
}

#[derive(Debug, Serialize)]
pub struct BatchItemResult {
    index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<Email>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchResult {
    results: Vec<BatchItemResult>,
}

/// `POST /emails/batch`. Each item is admitted independently; one
/// recipient's suppression or a bad address doesn't fail its siblings.
pub async fn create_batch(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<Vec<NewEmail>>,
) -> Result<(StatusCode, Json<BatchResult>), ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::SendEmail).await?;

    if body.len() > BATCH_MAX {
        return Err(Error::BadRequest(format!("batch exceeds maximum of {BATCH_MAX} emails")).into());
    }

    let mut results = Vec::with_capacity(body.len());
    for (index, new) in body.into_iter().enumerate() {
        match state.pipeline.submit(caller.tenant.id, new, addr.ip(), None).await {
            Ok(email) => results.push(BatchItemResult { index, email: Some(email), error: None }),
            Err(err) => results.push(BatchItemResult { index, email: None, error: Some(err.to_string()) }),
        }
    }

    Ok((StatusCode::ACCEPTED, Json(BatchResult { results })))
}

pub async fn get(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<EmailId>,
) -> Result<Json<Email>, ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::ReadEmail).await?;
    let email = state.emails.get(caller.tenant.id, id).await?.ok_or(Error::NotFound("email not found"))?;
    Ok(Json(email))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Email>>, ApiError> {
    let caller = authorize(&state.tenant_context, &headers, Permission::ReadEmail).await?;
    let emails = state.emails.list(caller.tenant.id, query.limit.min(200), query.offset).await?;
    Ok(Json(emails))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn idempotency_key_absent_is_none() {
        let headers = HeaderMap::new();
        assert_eq!(idempotency_key(&headers), None);
    }

    #[test]
    fn idempotency_key_reads_lowercase_header_name() {
        let mut headers = HeaderMap::new();
        headers.insert(IDEMPOTENCY_HEADER, axum::http::HeaderValue::from_static("order-123"));
        assert_eq!(idempotency_key(&headers), Some("order-123".to_string()));
    }
}
