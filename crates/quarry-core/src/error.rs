//! Error types for `quarry-core`.
//!
//! Backend failures arrive as the backend's own error type and are boxed into
//! the variant that matches the call site, so callers can tell a failed row
//! write (recoverable per pair) from a failed ledger write (fatal).

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A boxed backend error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid range: {min} > {max}")]
  InvalidRange {
    min: DateTime<Utc>,
    max: DateTime<Utc>,
  },

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  #[error("invalid config: {0}")]
  InvalidConfig(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("no feeder registered under {0:?}")]
  UnknownFeeder(String),

  /// Retries exhausted against the remote source.
  #[error("transient fetch failure after {attempts} attempt(s): {reason}")]
  TransientFetch { attempts: u32, reason: String },

  /// Row write not acknowledged by the partition store.
  #[error("storage write failed: {0}")]
  StorageWrite(#[source] BoxError),

  #[error("storage read failed: {0}")]
  StorageRead(#[source] BoxError),

  /// Coverage ledger or audit log write failed. The ledger can no longer be
  /// trusted to describe what was fetched, so this aborts the whole request.
  #[error("coverage write failed: {0}")]
  CoverageWrite(#[source] BoxError),

  #[error("request cancelled")]
  Cancelled,

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  pub(crate) fn storage_write<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::StorageWrite(Box::new(e))
  }

  pub(crate) fn storage_read<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::StorageRead(Box::new(e))
  }

  pub(crate) fn coverage_write<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::CoverageWrite(Box::new(e))
  }

  /// Whether the error must abort the whole request rather than one pair.
  pub fn is_fatal(&self) -> bool {
    matches!(self, Self::CoverageWrite(_) | Self::Serialization(_))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
