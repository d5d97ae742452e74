//! The coverage ledger: which time ranges are cached for each
//! (entity, field) pair, and the registry of field names in a collection.
//!
//! This is the source of truth for "what is cached". Every mutation is
//! written through to the [`DocumentStore`] before it returns.

use std::{collections::BTreeSet, sync::Arc};

use tokio::sync::RwLock;
use tracing::debug;

use crate::{
  Error, Result,
  interval::IntervalSet,
  ledger::CoverageRecord,
  store::DocumentStore,
};

// ─── FieldRegistry ───────────────────────────────────────────────────────────

/// Known field names for one collection.
///
/// Populated from storage when the collection is opened, grown on first use of
/// a new field, and shrunk only by an explicit drop.
#[derive(Debug, Default)]
pub struct FieldRegistry {
  known: RwLock<BTreeSet<String>>,
}

impl FieldRegistry {
  pub async fn load<S: DocumentStore>(store: &S, collection: &str) -> Result<Self> {
    let fields = store
      .load_fields(collection)
      .await
      .map_err(Error::storage_read)?;
    Ok(Self { known: RwLock::new(fields.into_iter().collect()) })
  }

  pub async fn contains(&self, field: &str) -> bool {
    self.known.read().await.contains(field)
  }

  /// Sorted field names.
  pub async fn fields(&self) -> Vec<String> {
    self.known.read().await.iter().cloned().collect()
  }

  /// Persist `field` if it is new. Returns whether it was added.
  pub async fn register<S: DocumentStore>(
    &self,
    store: &S,
    collection: &str,
    field: &str,
  ) -> Result<bool> {
    if self.contains(field).await {
      return Ok(false);
    }
    let mut known = self.known.write().await;
    if known.contains(field) {
      return Ok(false);
    }
    store
      .insert_field(collection, field)
      .await
      .map_err(Error::coverage_write)?;
    known.insert(field.to_owned());
    debug!(collection, field, "registered field");
    Ok(true)
  }

  pub async fn drop_field<S: DocumentStore>(
    &self,
    store: &S,
    collection: &str,
    field: &str,
  ) -> Result<bool> {
    let mut known = self.known.write().await;
    if !known.contains(field) {
      return Ok(false);
    }
    store
      .delete_field(collection, field)
      .await
      .map_err(Error::coverage_write)?;
    known.remove(field);
    Ok(true)
  }
}

// ─── CoverageStore ───────────────────────────────────────────────────────────

/// Per-collection view over the persisted coverage documents.
pub struct CoverageStore<S> {
  store:      Arc<S>,
  collection: String,
  registry:   FieldRegistry,
}

impl<S: DocumentStore> CoverageStore<S> {
  /// Bind to `collection` and load its field registry.
  pub async fn open(store: Arc<S>, collection: impl Into<String>) -> Result<Self> {
    let collection = collection.into();
    let registry = FieldRegistry::load(store.as_ref(), &collection).await?;
    Ok(Self { store, collection, registry })
  }

  pub fn collection(&self) -> &str { &self.collection }

  pub fn registry(&self) -> &FieldRegistry { &self.registry }

  /// Coverage for one pair. Missing documents and missing fields both read
  /// as an empty set.
  pub async fn get(&self, entity: &str, field: &str) -> Result<IntervalSet> {
    Ok(
      self
        .record(entity)
        .await?
        .map(|record| record.field(field))
        .unwrap_or_default(),
    )
  }

  pub async fn record(&self, entity: &str) -> Result<Option<CoverageRecord>> {
    self
      .store
      .load_coverage(&self.collection, entity)
      .await
      .map_err(Error::storage_read)
  }

  /// Replace the coverage of one pair, creating the entity document and
  /// registering the field as needed.
  pub async fn set(&self, entity: &str, field: &str, coverage: &IntervalSet) -> Result<()> {
    self
      .registry
      .register(self.store.as_ref(), &self.collection, field)
      .await?;
    self
      .store
      .save_coverage(&self.collection, entity, field, coverage)
      .await
      .map_err(Error::coverage_write)
  }

  /// Clear `fields` from the entity's document.
  ///
  /// Fails with [`Error::NotFound`] if the entity has no document.
  pub async fn delete(&self, entity: &str, fields: &[String]) -> Result<()> {
    let existed = self
      .store
      .unset_coverage(&self.collection, entity, fields)
      .await
      .map_err(Error::coverage_write)?;
    if !existed {
      return Err(Error::NotFound(format!(
        "no coverage record for entity {entity:?} in {:?}",
        self.collection
      )));
    }
    Ok(())
  }

  /// Remove `field` from every document and from the registry.
  /// Entities with any coverage document in this collection.
  pub async fn entities(&self) -> Result<Vec<String>> {
    self
      .store
      .coverage_entities(&self.collection)
      .await
      .map_err(Error::storage_read)
  }

  pub async fn drop_field(&self, field: &str) -> Result<()> {
    let entities = self.entities().await?;
    let fields = [field.to_owned()];
    for entity in entities {
      self.delete(&entity, &fields).await?;
    }
    self
      .registry
      .drop_field(self.store.as_ref(), &self.collection, field)
      .await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};

  use super::*;
  use crate::{interval::TimeInterval, memory::MemoryStore};

  fn set_of(a: u32, b: u32) -> IntervalSet {
    let min = Utc.with_ymd_and_hms(2020, 1, a, 0, 0, 0).unwrap();
    let max = Utc.with_ymd_and_hms(2020, 1, b, 0, 0, 0).unwrap();
    IntervalSet::from_intervals([TimeInterval::new(min, max).unwrap()])
  }

  async fn coverage(store: &MemoryStore) -> CoverageStore<MemoryStore> {
    CoverageStore::open(Arc::new(store.clone()), "prices")
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn get_missing_is_empty() {
    let cov = coverage(&MemoryStore::new()).await;
    assert!(cov.get("000001.SZ", "close").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn set_then_get_and_register() {
    let store = MemoryStore::new();
    let cov = coverage(&store).await;
    cov.set("000001.SZ", "close", &set_of(1, 5)).await.unwrap();

    assert_eq!(cov.get("000001.SZ", "close").await.unwrap(), set_of(1, 5));
    assert!(cov.get("000001.SZ", "open").await.unwrap().is_empty());
    assert!(cov.registry().contains("close").await);

    // A fresh handle sees the persisted registry.
    let reopened = coverage(&store).await;
    assert_eq!(reopened.registry().fields().await, vec!["close".to_owned()]);
  }

  #[tokio::test]
  async fn delete_unknown_entity_is_not_found() {
    let cov = coverage(&MemoryStore::new()).await;
    let err = cov.delete("nope", &["close".to_owned()]).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
  }

  #[tokio::test]
  async fn delete_clears_named_fields_only() {
    let cov = coverage(&MemoryStore::new()).await;
    cov.set("a", "close", &set_of(1, 5)).await.unwrap();
    cov.set("a", "open", &set_of(2, 3)).await.unwrap();

    cov.delete("a", &["close".to_owned()]).await.unwrap();
    assert!(cov.get("a", "close").await.unwrap().is_empty());
    assert_eq!(cov.get("a", "open").await.unwrap(), set_of(2, 3));
  }

  #[tokio::test]
  async fn drop_field_clears_everywhere() {
    let cov = coverage(&MemoryStore::new()).await;
    cov.set("a", "close", &set_of(1, 5)).await.unwrap();
    cov.set("b", "close", &set_of(1, 5)).await.unwrap();

    cov.drop_field("close").await.unwrap();
    assert!(cov.get("a", "close").await.unwrap().is_empty());
    assert!(cov.get("b", "close").await.unwrap().is_empty());
    assert!(!cov.registry().contains("close").await);
  }

  #[tokio::test]
  async fn failed_ledger_write_is_coverage_error() {
    let store = MemoryStore::new();
    let cov = coverage(&store).await;
    store.fail_ledger_writes(true);
    let err = cov.set("a", "close", &set_of(1, 5)).await.unwrap_err();
    assert!(matches!(err, Error::CoverageWrite(_)));
    assert!(err.is_fatal());
  }
}
