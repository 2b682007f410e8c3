mod dialect;

pub use dialect::Dialect;

use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::AnyPool;
use thiserror::Error;

use crate::config::{Config, StorageBackend};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to storage backend: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[source] sqlx::migrate::MigrateError),
}

/// Builds the pool used by every repository. Backed by `sqlx::Any` so the
/// same repository code runs unmodified against either supported backend
///; the small
/// set of genuinely dialect-sensitive decisions (see `dialect.rs`) are kept
/// out of individual queries by generating ids and timestamps in
/// application code rather than relying on backend-specific SQL functions.
pub async fn connect(config: &Config) -> Result<AnyPool, StorageError> {
    install_default_drivers();

    let pool = AnyPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .map_err(StorageError::Connect)?;

    Ok(pool)
}

pub async fn migrate(pool: &AnyPool) -> Result<(), StorageError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(StorageError::Migrate)
}

pub fn dialect_for(backend: StorageBackend) -> Dialect {
    match backend {
        StorageBackend::Postgres => Dialect::Postgres,
        StorageBackend::Sqlite => Dialect::Sqlite,
    }
}

/// `sqlx::Any` only implements `Decode`/`Encode` for a small set of
/// primitive types, so ids, timestamps and JSON payloads are stored as text
/// and converted in application code. These helpers centralise that
/// conversion so repositories don't repeat it.
pub mod row {
    use chrono::{DateTime, Utc};
    use serde::de::DeserializeOwned;
    use sqlx::any::AnyRow;
    use sqlx::Row;
    use uuid::Uuid;

    use crate::models::Error;

    pub fn uuid(row: &AnyRow, col: &str) -> Result<Uuid, Error> {
        let raw: String = row.try_get(col)?;
        Uuid::parse_str(&raw).map_err(|e| Error::Internal(format!("invalid uuid in {col}: {e}")))
    }

    pub fn uuid_opt(row: &AnyRow, col: &str) -> Result<Option<Uuid>, Error> {
        let raw: Option<String> = row.try_get(col)?;
        raw.map(|raw| {
            Uuid::parse_str(&raw).map_err(|e| Error::Internal(format!("invalid uuid in {col}: {e}")))
        })
        .transpose()
    }

    pub fn datetime(row: &AnyRow, col: &str) -> Result<DateTime<Utc>, Error> {
        let raw: String = row.try_get(col)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::Internal(format!("invalid timestamp in {col}: {e}")))
    }

    pub fn datetime_opt(row: &AnyRow, col: &str) -> Result<Option<DateTime<Utc>>, Error> {
        let raw: Option<String> = row.try_get(col)?;
        raw.map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| Error::Internal(format!("invalid timestamp in {col}: {e}")))
        })
        .transpose()
    }

    pub fn json<T: DeserializeOwned>(row: &AnyRow, col: &str) -> Result<T, Error> {
        let raw: String = row.try_get(col)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn json_opt<T: DeserializeOwned>(row: &AnyRow, col: &str) -> Result<Option<T>, Error> {
        let raw: Option<String> = row.try_get(col)?;
        raw.map(|raw| serde_json::from_str(&raw)).transpose().map_err(Error::from)
    }

    pub fn now_rfc3339() -> String {
        Utc::now().to_rfc3339()
    }
}
