//! Error type for `farebid-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("decimal parse error: {0}")]
  Decimal(#[from] rust_decimal::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("ride {0} already exists")]
  DuplicateRide(uuid::Uuid),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
