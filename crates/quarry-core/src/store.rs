//! The `DocumentStore` trait: everything the engine needs from persistence.
//!
//! The trait is implemented by storage backends (`quarry-store-sqlite`, and
//! [`crate::memory::MemoryStore`] for tests). The engine layers in this crate
//! depend on this abstraction, not on any concrete backend.
//!
//! Every write must be durable when its future resolves `Ok`; there is no
//! separate commit step.

use std::future::Future;

use crate::{
  calendar::Direction,
  interval::{IntervalSet, TimeInterval, Timestamp},
  ledger::{AuditLogEntry, CoverageRecord},
  row::{Row, RowFilter},
};

/// Abstraction over the document store backing one or more collections.
///
/// All methods are scoped by a collection name; a backend keeps collections
/// fully separate. Methods return `Send` futures so the engine can drive
/// several (entity, field) pairs on a multi-threaded runtime.
pub trait DocumentStore: Send + Sync + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Coverage ledger ───────────────────────────────────────────────────

  /// The coverage document for `entity`, or `None` if none was ever written.
  fn load_coverage(
    &self,
    collection: &str,
    entity: &str,
  ) -> impl Future<Output = Result<Option<CoverageRecord>, Self::Error>> + Send;

  /// Upsert one field of the entity's coverage document, creating the
  /// document if needed.
  fn save_coverage(
    &self,
    collection: &str,
    entity: &str,
    field: &str,
    coverage: &IntervalSet,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send;

  /// Unset `fields` in the entity's document. Returns `false` if the entity
  /// has no document at all.
  fn unset_coverage(
    &self,
    collection: &str,
    entity: &str,
    fields: &[String],
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

  /// Entities that have a coverage document.
  fn coverage_entities(
    &self,
    collection: &str,
  ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send;

  // ── Field registry ────────────────────────────────────────────────────

  fn load_fields(
    &self,
    collection: &str,
  ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send;

  /// Idempotent.
  fn insert_field(
    &self,
    collection: &str,
    field: &str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send;

  fn delete_field(
    &self,
    collection: &str,
    field: &str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send;

  // ── Audit log ─────────────────────────────────────────────────────────

  /// Append a batch of entries in one call.
  fn append_log(
    &self,
    collection: &str,
    entries: &[AuditLogEntry],
  ) -> impl Future<Output = Result<(), Self::Error>> + Send;

  /// Entries in timestamp order, optionally restricted to one entity.
  fn read_log(
    &self,
    collection: &str,
    entity: Option<&str>,
  ) -> impl Future<Output = Result<Vec<AuditLogEntry>, Self::Error>> + Send;

  // ── Year partitions ───────────────────────────────────────────────────

  /// Years that have a partition, ascending.
  fn partitions(
    &self,
    collection: &str,
  ) -> impl Future<Output = Result<Vec<i32>, Self::Error>> + Send;

  /// Upsert rows keyed by `(entity, timestamp)` into the `year` partition.
  /// Values are merged field by field into any existing row. Null values
  /// are never stored and leave an existing value untouched, so upserting
  /// the same rows twice is a no-op. Returns the number of rows written.
  fn upsert_rows(
    &self,
    collection: &str,
    year: i32,
    rows: Vec<Row>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send;

  fn find_rows(
    &self,
    collection: &str,
    year: i32,
    filter: &RowFilter,
  ) -> impl Future<Output = Result<Vec<Row>, Self::Error>> + Send;

  /// Clear `field` on the entity's rows inside `range`. Rows themselves are
  /// kept. Returns the number of rows touched.
  fn unset_field(
    &self,
    collection: &str,
    year: i32,
    entity: &str,
    field: &str,
    range: TimeInterval,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send;

  /// Clear `field` on every row of the partition.
  fn drop_field(
    &self,
    collection: &str,
    year: i32,
    field: &str,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send;

  /// Nearest observation timestamp for any of `entities` within the `year`
  /// partition, looking in `direction` from `at` (inclusive).
  fn nearest(
    &self,
    collection: &str,
    year: i32,
    entities: &[String],
    at: Timestamp,
    direction: Direction,
  ) -> impl Future<Output = Result<Option<Timestamp>, Self::Error>> + Send;

  /// Earliest and latest timestamps stored in the partition.
  fn bounds(
    &self,
    collection: &str,
    year: i32,
  ) -> impl Future<Output = Result<Option<(Timestamp, Timestamp)>, Self::Error>> + Send;

  fn distinct_entities(
    &self,
    collection: &str,
    year: i32,
  ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send;

  fn count_rows(
    &self,
    collection: &str,
    year: i32,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send;
}
