//! Pluggable data sources.
//!
//! A [`Feeder`] fetches rows for one (entity, field, range) request. Feeders
//! are registered by name in a [`FeederRegistry`] and resolved once, when a
//! collection is built. Each `update` call hands the feeder a fresh
//! [`FetchCache`] so a source that returns many fields per remote call can
//! serve the remaining fields without calling out again.

use std::{
  collections::HashMap,
  fmt,
  future::Future,
  sync::{Arc, Mutex as StdMutex},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::{
  Error, Result,
  interval::{TimeInterval, Timestamp},
  row::Row,
};

/// One fetch: rows for `entity` carrying `field`, stamped in `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRequest {
  pub source: String,
  pub entity: String,
  pub field:  String,
  pub start:  Timestamp,
  pub end:    Timestamp,
}

impl FeedRequest {
  pub fn new(
    source: impl Into<String>,
    entity: impl Into<String>,
    field: impl Into<String>,
    gap: TimeInterval,
  ) -> Self {
    Self {
      source: source.into(),
      entity: entity.into(),
      field:  field.into(),
      start:  gap.min(),
      end:    gap.max(),
    }
  }

  pub fn contains(&self, ts: Timestamp) -> bool { self.start <= ts && ts < self.end }
}

/// How a fetch failed. Only transient failures are retried.
///
/// An empty `Ok` result means the source has no data for the range. Feeders
/// must return an error rather than an empty result when they could not
/// tell.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
  #[error("transient: {0}")]
  Transient(String),
  #[error("permanent: {0}")]
  Permanent(String),
}

impl FeedError {
  pub fn transient(reason: impl fmt::Display) -> Self {
    Self::Transient(reason.to_string())
  }

  pub fn permanent(reason: impl fmt::Display) -> Self {
    Self::Permanent(reason.to_string())
  }

  pub fn is_transient(&self) -> bool { matches!(self, Self::Transient(_)) }
}

#[async_trait]
pub trait Feeder: Send + Sync {
  async fn fetch(
    &self,
    request: &FeedRequest,
    cache: &FetchCache,
  ) -> Result<Vec<Row>, FeedError>;
}

// ─── FnFeeder ────────────────────────────────────────────────────────────────

/// Adapts an async closure taking the request by value.
pub struct FnFeeder<F> {
  f: F,
}

impl<F> FnFeeder<F> {
  pub fn new<Fut>(f: F) -> Self
  where
    F: Fn(FeedRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Row>, FeedError>> + Send,
  {
    Self { f }
  }
}

#[async_trait]
impl<F, Fut> Feeder for FnFeeder<F>
where
  F: Fn(FeedRequest) -> Fut + Send + Sync,
  Fut: Future<Output = Result<Vec<Row>, FeedError>> + Send,
{
  async fn fetch(
    &self,
    request: &FeedRequest,
    _cache: &FetchCache,
  ) -> Result<Vec<Row>, FeedError> {
    (self.f)(request.clone()).await
  }
}

// ─── FeederRegistry ──────────────────────────────────────────────────────────

#[derive(Default, Clone)]
pub struct FeederRegistry {
  feeders: HashMap<String, Arc<dyn Feeder>>,
}

impl FeederRegistry {
  pub fn new() -> Self { Self::default() }

  pub fn register(
    &mut self,
    name: impl Into<String>,
    feeder: impl Feeder + 'static,
  ) -> &mut Self {
    self.feeders.insert(name.into(), Arc::new(feeder));
    self
  }

  pub fn register_arc(
    &mut self,
    name: impl Into<String>,
    feeder: Arc<dyn Feeder>,
  ) -> &mut Self {
    self.feeders.insert(name.into(), feeder);
    self
  }

  pub fn resolve(&self, name: &str) -> Result<Arc<dyn Feeder>> {
    self
      .feeders
      .get(name)
      .cloned()
      .ok_or_else(|| Error::UnknownFeeder(name.to_owned()))
  }

  /// Registered names, sorted.
  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.feeders.keys().cloned().collect();
    names.sort();
    names
  }
}

impl fmt::Debug for FeederRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FeederRegistry").field("feeders", &self.names()).finish()
  }
}

// ─── FetchCache ──────────────────────────────────────────────────────────────

type Batch = Arc<Vec<Row>>;

/// Batches fetched during one call, keyed by `(source, entity)`.
///
/// Concurrent requests for the same key share one fetch.
#[derive(Default)]
pub struct FetchCache {
  batches: StdMutex<HashMap<(String, String), Arc<OnceCell<Batch>>>>,
}

impl FetchCache {
  pub fn new() -> Self { Self::default() }

  fn cell(&self, source: &str, entity: &str) -> Arc<OnceCell<Batch>> {
    let mut batches = match self.batches.lock() {
      Ok(b) => b,
      Err(poisoned) => poisoned.into_inner(),
    };
    batches
      .entry((source.to_owned(), entity.to_owned()))
      .or_default()
      .clone()
  }

  pub fn get(&self, source: &str, entity: &str) -> Option<Batch> {
    self.cell(source, entity).get().cloned()
  }

  /// The cached batch for the key, or the result of `load`, which is cached
  /// only on success.
  pub async fn get_or_try_load<F, Fut>(
    &self,
    source: &str,
    entity: &str,
    load: F,
  ) -> Result<Batch, FeedError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<Row>, FeedError>>,
  {
    let cell = self.cell(source, entity);
    cell
      .get_or_try_init(|| async { load().await.map(Arc::new) })
      .await
      .cloned()
  }

  pub fn len(&self) -> usize {
    let batches = match self.batches.lock() {
      Ok(b) => b,
      Err(poisoned) => poisoned.into_inner(),
    };
    batches.values().filter(|cell| cell.initialized()).count()
  }

  pub fn is_empty(&self) -> bool { self.len() == 0 }
}
