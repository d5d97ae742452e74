//! Error type for `quarry-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time decode error: {0}")]
  DateParse(String),

  /// A stored value that does not decode into a core type.
  #[error("corrupt record: {0}")]
  Corrupt(String),

  /// Collection and field names end up in table names and JSON paths.
  #[error("invalid name {0:?}")]
  InvalidName(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
