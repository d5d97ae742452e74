//! Observations and the filters used to read them back.

use std::collections::BTreeMap;

use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::interval::{TimeInterval, Timestamp};

/// A single observation: one entity at one instant, with any number of
/// field values. Stored in the partition for `timestamp.year()` and keyed by
/// `(entity, timestamp)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
  pub entity:    String,
  pub timestamp: Timestamp,
  #[serde(flatten)]
  pub values:    BTreeMap<String, serde_json::Value>,
}

impl Row {
  pub fn new(entity: impl Into<String>, timestamp: Timestamp) -> Self {
    Self { entity: entity.into(), timestamp, values: BTreeMap::new() }
  }

  /// Builder-style setter, mostly for feeders and tests.
  pub fn with(
    mut self,
    field: impl Into<String>,
    value: impl Into<serde_json::Value>,
  ) -> Self {
    self.values.insert(field.into(), value.into());
    self
  }

  pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
    self.values.get(field)
  }

  pub fn year(&self) -> i32 { self.timestamp.year() }

  /// Keep only `fields`; identity columns are always kept.
  pub fn project(mut self, fields: &[String]) -> Self {
    self.values.retain(|k, _| fields.iter().any(|f| f == k));
    self
  }
}

/// Which instants a partition read should return.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeFilter {
  All,
  Range(TimeInterval),
  /// Exact timestamps; used for calendar-grid reads.
  At(Vec<Timestamp>),
}

/// Parameters for [`crate::store::DocumentStore::find_rows`].
#[derive(Debug, Clone, PartialEq)]
pub struct RowFilter {
  /// `None` matches every entity.
  pub entities: Option<Vec<String>>,
  pub time:     TimeFilter,
  /// Projection; `None` returns all stored fields.
  pub fields:   Option<Vec<String>>,
}

impl RowFilter {
  pub fn range(entities: Option<Vec<String>>, range: TimeInterval) -> Self {
    Self { entities, time: TimeFilter::Range(range), fields: None }
  }

  pub fn at(entities: Option<Vec<String>>, at: Vec<Timestamp>) -> Self {
    Self { entities, time: TimeFilter::At(at), fields: None }
  }

  pub fn with_fields(mut self, fields: Option<Vec<String>>) -> Self {
    self.fields = fields;
    self
  }

  /// In-process evaluation, for backends without a query engine.
  pub fn matches(&self, entity: &str, ts: Timestamp) -> bool {
    let entity_ok = self
      .entities
      .as_ref()
      .is_none_or(|list| list.iter().any(|e| e == entity));
    let time_ok = match &self.time {
      TimeFilter::All => true,
      TimeFilter::Range(range) => range.contains(ts),
      TimeFilter::At(instants) => instants.contains(&ts),
    };
    entity_ok && time_ok
  }
}
