//! Maps the internal `models::Error` taxonomy onto the `{code, message,
//! details}` envelope every endpoint returns on failure.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use crate::models::Error as ModelError;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("invalid request body: {0}")]
    InvalidBody(#[from] JsonRejection),
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathRejection),
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] QueryRejection),
}

/// The stable UPPER_SNAKE code for a given internal error, independent of
/// the human-readable message.
fn code_and_status(err: &ModelError) -> (StatusCode, &'static str) {
    match err {
        ModelError::BadRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD"),
        ModelError::Email(_) => (StatusCode::BAD_REQUEST, "INVALID_EMAIL_FORMAT"),
        ModelError::Unauthenticated => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
        ModelError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN"),
        // Cross-tenant access is folded into NOT_FOUND at the wire level so a
        // caller can't use the error shape to enumerate other tenants' ids;
        // the distinguishing CROSS_TENANT code only ever appears in logs.
        ModelError::CrossTenant => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        ModelError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        ModelError::Conflict => (StatusCode::CONFLICT, "CONFLICT"),
        ModelError::DomainNotVerified(_) => (StatusCode::UNPROCESSABLE_ENTITY, "DOMAIN_NOT_VERIFIED"),
        ModelError::Suppressed(_) => (StatusCode::UNPROCESSABLE_ENTITY, "SUPPRESSED"),
        ModelError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
        ModelError::QuotaExceeded => (StatusCode::TOO_MANY_REQUESTS, "QUOTA_EXCEEDED"),
        ModelError::Database(_)
        | ModelError::ForeignKeyViolation
        | ModelError::Serialization(_)
        | ModelError::Crypto(_)
        | ModelError::WrongCryptKey(_)
        | ModelError::MailAuth(_)
        | ModelError::FromUtf8(_)
        | ModelError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
    }
}

fn details(err: &ModelError) -> serde_json::Value {
    match err {
        ModelError::DomainNotVerified(domain) => json!({ "domain": domain }),
        ModelError::Suppressed(address) => json!({ "address": address }),
        ModelError::RateLimited(scope) => json!({ "scope": scope }),
        _ => serde_json::Value::Null,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let model_err = match self {
            ApiError::Model(e) => e,
            ApiError::InvalidBody(rejection) => {
                warn!("rejected request body: {rejection}");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "code": "INVALID_PAYLOAD", "message": rejection.to_string(), "details": null })),
                )
                    .into_response();
            }
            ApiError::InvalidPath(rejection) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "code": "INVALID_PAYLOAD", "message": rejection.to_string(), "details": null })),
                )
                    .into_response();
            }
            ApiError::InvalidQuery(rejection) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "code": "INVALID_PAYLOAD", "message": rejection.to_string(), "details": null })),
                )
                    .into_response();
            }
        };

        if matches!(model_err, ModelError::CrossTenant) {
            warn!("CROSS_TENANT access attempt: {model_err}");
        }
        let (status, code) = code_and_status(&model_err);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal API error: {model_err}");
        }

        (status, Json(json!({ "code": code, "message": model_err.to_string(), "details": details(&model_err) }))).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cross_tenant_folds_into_not_found() {
        let (status, code) = code_and_status(&ModelError::CrossTenant);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code, "NOT_FOUND");
    }

    #[test]
    fn domain_not_verified_is_unprocessable_with_domain_detail() {
        let err = ModelError::DomainNotVerified("example.com".to_string());
        let (status, code) = code_and_status(&err);
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(code, "DOMAIN_NOT_VERIFIED");
        assert_eq!(details(&err), json!({ "domain": "example.com" }));
    }

    #[test]
    fn unauthenticated_and_forbidden_map_distinctly() {
        assert_eq!(code_and_status(&ModelError::Unauthenticated).0, StatusCode::UNAUTHORIZED);
        assert_eq!(code_and_status(&ModelError::Forbidden).0, StatusCode::FORBIDDEN);
    }

    #[test]
    fn database_errors_never_leak_as_client_errors() {
        let (status, code) = code_and_status(&ModelError::Conflict);
        assert_ne!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(code, "CONFLICT");
        let (status, _) = code_and_status(&ModelError::ForeignKeyViolation);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn details_is_null_for_plain_errors() {
        assert_eq!(details(&ModelError::Conflict), serde_json::Value::Null);
    }
}
