mod analytics_event;
mod api_key;
mod domain;
mod email;
mod rate_limit;
mod suppression;
mod tenant;
mod webhook;

pub use analytics_event::*;
pub use api_key::*;
pub use domain::*;
pub use email::*;
pub use rate_limit::*;
pub use suppression::*;
pub use tenant::*;
pub use webhook::*;

use thiserror::Error;

/// Unified internal error taxonomy: one flat enum, `#[from]` bridges for
/// infrastructure errors, plus the policy-level variants the HTTP layer
/// needs to surface a stable error code without re-deriving it from strings.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("foreign key violation")]
    ForeignKeyViolation,
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Email(#[from] email_address::Error),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
    #[error("cryptographic error: {0}")]
    Crypto(#[from] aws_lc_rs::error::Unspecified),
    #[error("key rejected: {0}")]
    WrongCryptKey(#[from] aws_lc_rs::error::KeyRejected),
    #[error("email authentication error: {0}")]
    MailAuth(#[from] mail_auth::Error),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("conflict")]
    Conflict,
    #[error("invalid utf8")]
    FromUtf8(#[from] std::string::FromUtf8Error),
    #[error("domain {0} is not verified")]
    DomainNotVerified(String),
    #[error("recipient {0} is suppressed")]
    Suppressed(String),
    #[error("rate limit exceeded for scope {0}")]
    RateLimited(String),
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("cross-tenant access denied")]
    CrossTenant,
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("forbidden")]
    Forbidden,
}

impl From<sqlx::Error> for Error {
    fn from(sql: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &sql {
            if db_err.is_unique_violation() {
                return Error::Conflict;
            }
            if db_err.is_foreign_key_violation() {
                return Error::ForeignKeyViolation;
            }
        }
        if matches!(sql, sqlx::Error::RowNotFound) {
            return Error::NotFound("not found");
        }
        Error::Database(sql)
    }
}
