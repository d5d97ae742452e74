//! Encoding and decoding helpers between core types and SQLite columns.
//!
//! Row and interval timestamps are stored as epoch microseconds so range
//! filters compare integers. Audit timestamps are fixed-width RFC 3339
//! strings. Row values and coverage sets are compact JSON.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use quarry_core::{
  Row, TimeInterval, Timestamp,
  interval::IntervalSet,
  ledger::{AuditLogEntry, Operation},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Names ───────────────────────────────────────────────────────────────────

/// Collection names become part of table names.
pub fn check_collection(collection: &str) -> Result<()> {
  let valid = !collection.is_empty()
    && collection
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '_');
  if valid { Ok(()) } else { Err(Error::InvalidName(collection.to_owned())) }
}

pub fn partition_table(collection: &str, year: i32) -> Result<String> {
  check_collection(collection)?;
  Ok(format!("rows_{collection}_{year}"))
}

/// JSON path selecting the top-level key `field`.
pub fn json_path(field: &str) -> Result<String> {
  if field.is_empty() || field.contains(['"', '\\']) {
    return Err(Error::InvalidName(field.to_owned()));
  }
  Ok(format!("$.\"{field}\""))
}

// ─── Timestamps ──────────────────────────────────────────────────────────────

pub fn encode_ts(ts: Timestamp) -> i64 { ts.timestamp_micros() }

pub fn decode_ts(micros: i64) -> Result<Timestamp> {
  DateTime::from_timestamp_micros(micros)
    .ok_or_else(|| Error::DateParse(format!("timestamp out of range: {micros}")))
}

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339_opts(SecondsFormat::Micros, true) }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Coverage ────────────────────────────────────────────────────────────────

pub fn encode_intervals(set: &IntervalSet) -> Result<String> { Ok(serde_json::to_string(set)?) }

pub fn decode_fields(s: &str) -> Result<BTreeMap<String, IntervalSet>> {
  Ok(serde_json::from_str(s)?)
}

// ─── Rows ────────────────────────────────────────────────────────────────────

/// `(entity, ts, data)` ready to bind. Null values are left out: `json_patch`
/// would read them as deletions on a later upsert.
pub fn encode_row(row: &Row) -> Result<(String, i64, String)> {
  let values: BTreeMap<&String, &serde_json::Value> =
    row.values.iter().filter(|(_, v)| !v.is_null()).collect();
  Ok((row.entity.clone(), encode_ts(row.timestamp), serde_json::to_string(&values)?))
}

pub struct RawRow {
  pub entity: String,
  pub ts:     i64,
  pub data:   String,
}

impl RawRow {
  pub fn into_row(self) -> Result<Row> {
    Ok(Row {
      entity:    self.entity,
      timestamp: decode_ts(self.ts)?,
      values:    serde_json::from_str(&self.data)?,
    })
  }
}

// ─── Audit log ───────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

/// Raw columns read directly from an `audit_log` row.
pub struct RawLogEntry {
  pub entry_id:     String,
  pub recorded_at:  String,
  pub operation:    String,
  pub entity:       String,
  pub field:        String,
  pub interval_min: i64,
  pub interval_max: i64,
}

impl RawLogEntry {
  pub fn into_entry(self) -> Result<AuditLogEntry> {
    let operation: Operation = self
      .operation
      .parse()
      .map_err(|_| Error::Corrupt(format!("unknown operation {:?}", self.operation)))?;
    let interval = TimeInterval::new(decode_ts(self.interval_min)?, decode_ts(self.interval_max)?)
      .map_err(|e| Error::Corrupt(e.to_string()))?;
    Ok(AuditLogEntry {
      entry_id: Uuid::parse_str(&self.entry_id)?,
      timestamp: decode_dt(&self.recorded_at)?,
      operation,
      entity: self.entity,
      field: self.field,
      interval,
    })
  }
}
