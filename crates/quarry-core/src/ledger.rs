//! Persisted ledger records: coverage documents and audit log entries.
//!
//! Coverage records are mutated in place (one document per entity). Audit log
//! entries are append-only and never rewritten.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::interval::{IntervalSet, TimeInterval, Timestamp};

/// Everything known to be cached for one entity, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRecord {
  pub entity: String,
  pub fields: BTreeMap<String, IntervalSet>,
}

impl CoverageRecord {
  pub fn field(&self, field: &str) -> IntervalSet {
    self.fields.get(field).cloned().unwrap_or_default()
  }
}

/// The kind of coverage mutation an [`AuditLogEntry`] records.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
  Insert,
  Remove,
}

/// One coverage mutation. `interval` is the requested gap (for inserts) or the
/// cleared sub-range (for removals), whether or not data was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
  pub entry_id:  Uuid,
  pub timestamp: Timestamp,
  pub operation: Operation,
  pub entity:    String,
  pub field:     String,
  pub interval:  TimeInterval,
}

impl AuditLogEntry {
  pub fn new(
    operation: Operation,
    entity: impl Into<String>,
    field: impl Into<String>,
    interval: TimeInterval,
  ) -> Self {
    Self {
      entry_id: Uuid::new_v4(),
      timestamp: Utc::now(),
      operation,
      entity: entity.into(),
      field: field.into(),
      interval,
    }
  }
}
