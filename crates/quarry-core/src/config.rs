//! Tunables for fetching and the static description of a collection.

use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;

use crate::{Error, Result};

/// Retry, timeout, and parallelism limits for feeder calls.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FetchPolicy {
  /// Attempts per gap, including the first.
  pub max_attempts:         u32,
  /// Linear backoff step; attempt `n` waits `n * backoff_ms` before retrying.
  pub backoff_ms:           u64,
  /// Per-attempt limit on a single feeder call.
  pub timeout_ms:           u64,
  pub max_concurrent_pairs: usize,
}

impl Default for FetchPolicy {
  fn default() -> Self {
    Self { max_attempts: 3, backoff_ms: 500, timeout_ms: 30_000, max_concurrent_pairs: 4 }
  }
}

impl FetchPolicy {
  pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }

  /// Delay before retrying after failed attempt number `attempt` (1-based).
  pub fn backoff(&self, attempt: u32) -> Duration {
    Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
  }
}

/// One named collection and the feeder source that fills it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CollectionConfig {
  pub name:             String,
  /// Key under which the feeder is registered.
  pub source:           String,
  /// Spacing of observations; an observed row at `t` covers `[t, t + g)`.
  #[serde(default = "default_granularity_secs")]
  pub granularity_secs: i64,
}

fn default_granularity_secs() -> i64 { 86_400 }

impl CollectionConfig {
  pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
    Self {
      name:             name.into(),
      source:           source.into(),
      granularity_secs: default_granularity_secs(),
    }
  }

  /// The observation spacing; must be positive and at most a year.
  pub fn granularity(&self) -> Result<TimeDelta> {
    if self.granularity_secs <= 0 || self.granularity_secs > MAX_GRANULARITY_SECS {
      return Err(Error::InvalidConfig(format!(
        "collection {:?}: granularity_secs must be in 1..={MAX_GRANULARITY_SECS}, got {}",
        self.name, self.granularity_secs
      )));
    }
    TimeDelta::try_seconds(self.granularity_secs).ok_or_else(|| {
      Error::InvalidConfig(format!(
        "collection {:?}: granularity_secs {} is out of range",
        self.name, self.granularity_secs
      ))
    })
  }

  /// Checks the fields that deserialisation alone cannot.
  pub fn validate(&self) -> Result<()> { self.granularity().map(|_| ()) }
}

const MAX_GRANULARITY_SECS: i64 = 366 * 86_400;
