//! An in-process [`DocumentStore`].
//!
//! Holds everything in `BTreeMap`s behind a single `RwLock`. Used by the test
//! suites and by embedders that want a throwaway cache. Write failures can be
//! injected to exercise the engine's error paths.

use std::{
  collections::{BTreeMap, BTreeSet, HashMap},
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
};

use thiserror::Error;
use tokio::sync::RwLock;

use crate::{
  calendar::Direction,
  interval::{IntervalSet, TimeInterval, Timestamp},
  ledger::{AuditLogEntry, CoverageRecord},
  row::{Row, RowFilter},
  store::DocumentStore,
};

#[derive(Debug, Error)]
pub enum MemoryError {
  #[error("injected {0} write failure")]
  Injected(&'static str),
}

type Values = BTreeMap<String, serde_json::Value>;
type Partition = BTreeMap<(String, Timestamp), Values>;

#[derive(Default)]
struct Inner {
  coverage:   BTreeMap<(String, String), BTreeMap<String, IntervalSet>>,
  fields:     HashMap<String, BTreeSet<String>>,
  log:        HashMap<String, Vec<AuditLogEntry>>,
  partitions: BTreeMap<(String, i32), Partition>,
}

/// Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
  inner:              Arc<RwLock<Inner>>,
  fail_row_writes:    Arc<AtomicBool>,
  fail_ledger_writes: Arc<AtomicBool>,
}

impl MemoryStore {
  pub fn new() -> Self { Self::default() }

  /// Make every subsequent row write fail until switched off again.
  pub fn fail_row_writes(&self, fail: bool) {
    self.fail_row_writes.store(fail, Ordering::SeqCst);
  }

  /// Make every subsequent coverage, field and log write fail.
  pub fn fail_ledger_writes(&self, fail: bool) {
    self.fail_ledger_writes.store(fail, Ordering::SeqCst);
  }

  fn check_rows(&self) -> Result<(), MemoryError> {
    if self.fail_row_writes.load(Ordering::SeqCst) {
      return Err(MemoryError::Injected("row"));
    }
    Ok(())
  }

  fn check_ledger(&self) -> Result<(), MemoryError> {
    if self.fail_ledger_writes.load(Ordering::SeqCst) {
      return Err(MemoryError::Injected("ledger"));
    }
    Ok(())
  }
}

fn key(collection: &str, entity: &str) -> (String, String) {
  (collection.to_owned(), entity.to_owned())
}

impl DocumentStore for MemoryStore {
  type Error = MemoryError;

  // ── Coverage ledger ───────────────────────────────────────────────────────

  async fn load_coverage(
    &self,
    collection: &str,
    entity: &str,
  ) -> Result<Option<CoverageRecord>, MemoryError> {
    let inner = self.inner.read().await;
    Ok(inner.coverage.get(&key(collection, entity)).map(|fields| {
      CoverageRecord { entity: entity.to_owned(), fields: fields.clone() }
    }))
  }

  async fn save_coverage(
    &self,
    collection: &str,
    entity: &str,
    field: &str,
    coverage: &IntervalSet,
  ) -> Result<(), MemoryError> {
    self.check_ledger()?;
    let mut inner = self.inner.write().await;
    inner
      .coverage
      .entry(key(collection, entity))
      .or_default()
      .insert(field.to_owned(), coverage.clone());
    Ok(())
  }

  async fn unset_coverage(
    &self,
    collection: &str,
    entity: &str,
    fields: &[String],
  ) -> Result<bool, MemoryError> {
    self.check_ledger()?;
    let mut inner = self.inner.write().await;
    let Some(record) = inner.coverage.get_mut(&key(collection, entity)) else {
      return Ok(false);
    };
    for field in fields {
      record.remove(field);
    }
    Ok(true)
  }

  async fn coverage_entities(&self, collection: &str) -> Result<Vec<String>, MemoryError> {
    let inner = self.inner.read().await;
    Ok(
      inner
        .coverage
        .keys()
        .filter(|(c, _)| c == collection)
        .map(|(_, e)| e.clone())
        .collect(),
    )
  }

  // ── Field registry ────────────────────────────────────────────────────────

  async fn load_fields(&self, collection: &str) -> Result<Vec<String>, MemoryError> {
    let inner = self.inner.read().await;
    Ok(
      inner
        .fields
        .get(collection)
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default(),
    )
  }

  async fn insert_field(&self, collection: &str, field: &str) -> Result<(), MemoryError> {
    self.check_ledger()?;
    let mut inner = self.inner.write().await;
    inner
      .fields
      .entry(collection.to_owned())
      .or_default()
      .insert(field.to_owned());
    Ok(())
  }

  async fn delete_field(&self, collection: &str, field: &str) -> Result<(), MemoryError> {
    self.check_ledger()?;
    let mut inner = self.inner.write().await;
    if let Some(set) = inner.fields.get_mut(collection) {
      set.remove(field);
    }
    Ok(())
  }

  // ── Audit log ─────────────────────────────────────────────────────────────

  async fn append_log(
    &self,
    collection: &str,
    entries: &[AuditLogEntry],
  ) -> Result<(), MemoryError> {
    self.check_ledger()?;
    let mut inner = self.inner.write().await;
    inner
      .log
      .entry(collection.to_owned())
      .or_default()
      .extend_from_slice(entries);
    Ok(())
  }

  async fn read_log(
    &self,
    collection: &str,
    entity: Option<&str>,
  ) -> Result<Vec<AuditLogEntry>, MemoryError> {
    let inner = self.inner.read().await;
    let mut entries: Vec<AuditLogEntry> = inner
      .log
      .get(collection)
      .into_iter()
      .flatten()
      .filter(|e| entity.is_none_or(|want| e.entity == want))
      .cloned()
      .collect();
    entries.sort_by_key(|e| e.timestamp);
    Ok(entries)
  }

  // ── Year partitions ───────────────────────────────────────────────────────

  async fn partitions(&self, collection: &str) -> Result<Vec<i32>, MemoryError> {
    let inner = self.inner.read().await;
    Ok(
      inner
        .partitions
        .keys()
        .filter(|(c, _)| c == collection)
        .map(|(_, year)| *year)
        .collect(),
    )
  }

  async fn upsert_rows(
    &self,
    collection: &str,
    year: i32,
    rows: Vec<Row>,
  ) -> Result<usize, MemoryError> {
    self.check_rows()?;
    let mut inner = self.inner.write().await;
    let partition = inner
      .partitions
      .entry((collection.to_owned(), year))
      .or_default();
    let written = rows.len();
    for row in rows {
      partition
        .entry((row.entity, row.timestamp))
        .or_default()
        .extend(row.values.into_iter().filter(|(_, v)| !v.is_null()));
    }
    Ok(written)
  }

  async fn find_rows(
    &self,
    collection: &str,
    year: i32,
    filter: &RowFilter,
  ) -> Result<Vec<Row>, MemoryError> {
    let inner = self.inner.read().await;
    let Some(partition) = inner.partitions.get(&(collection.to_owned(), year)) else {
      return Ok(Vec::new());
    };
    Ok(
      partition
        .iter()
        .filter(|((entity, ts), _)| filter.matches(entity, *ts))
        .map(|((entity, ts), values)| {
          let row = Row { entity: entity.clone(), timestamp: *ts, values: values.clone() };
          match &filter.fields {
            Some(fields) => row.project(fields),
            None => row,
          }
        })
        .collect(),
    )
  }

  async fn unset_field(
    &self,
    collection: &str,
    year: i32,
    entity: &str,
    field: &str,
    range: TimeInterval,
  ) -> Result<usize, MemoryError> {
    self.check_rows()?;
    let mut inner = self.inner.write().await;
    let Some(partition) = inner.partitions.get_mut(&(collection.to_owned(), year)) else {
      return Ok(0);
    };
    let mut touched = 0;
    for ((e, ts), values) in partition.iter_mut() {
      if e == entity && range.contains(*ts) && values.remove(field).is_some() {
        touched += 1;
      }
    }
    Ok(touched)
  }

  async fn drop_field(
    &self,
    collection: &str,
    year: i32,
    field: &str,
  ) -> Result<usize, MemoryError> {
    self.check_rows()?;
    let mut inner = self.inner.write().await;
    let Some(partition) = inner.partitions.get_mut(&(collection.to_owned(), year)) else {
      return Ok(0);
    };
    Ok(
      partition
        .values_mut()
        .filter_map(|values| values.remove(field))
        .count(),
    )
  }

  async fn nearest(
    &self,
    collection: &str,
    year: i32,
    entities: &[String],
    at: Timestamp,
    direction: Direction,
  ) -> Result<Option<Timestamp>, MemoryError> {
    let inner = self.inner.read().await;
    let Some(partition) = inner.partitions.get(&(collection.to_owned(), year)) else {
      return Ok(None);
    };
    let candidates = partition
      .keys()
      .filter(|(entity, _)| entities.contains(entity))
      .map(|(_, ts)| *ts);
    Ok(match direction {
      Direction::Earlier => candidates.filter(|ts| *ts <= at).max(),
      Direction::Later => candidates.filter(|ts| *ts >= at).min(),
    })
  }

  async fn bounds(
    &self,
    collection: &str,
    year: i32,
  ) -> Result<Option<(Timestamp, Timestamp)>, MemoryError> {
    let inner = self.inner.read().await;
    let Some(partition) = inner.partitions.get(&(collection.to_owned(), year)) else {
      return Ok(None);
    };
    let first = partition.keys().map(|(_, ts)| *ts).min();
    let last = partition.keys().map(|(_, ts)| *ts).max();
    Ok(first.zip(last))
  }

  async fn distinct_entities(
    &self,
    collection: &str,
    year: i32,
  ) -> Result<Vec<String>, MemoryError> {
    let inner = self.inner.read().await;
    let entities: BTreeSet<String> = inner
      .partitions
      .get(&(collection.to_owned(), year))
      .into_iter()
      .flat_map(|p| p.keys().map(|(entity, _)| entity.clone()))
      .collect();
    Ok(entities.into_iter().collect())
  }

  async fn count_rows(&self, collection: &str, year: i32) -> Result<u64, MemoryError> {
    let inner = self.inner.read().await;
    Ok(
      inner
        .partitions
        .get(&(collection.to_owned(), year))
        .map_or(0, |p| p.len() as u64),
    )
  }
}
