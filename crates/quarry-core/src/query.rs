//! Read-request parameters.

use tokio::sync::watch;

use crate::{
  Error, Result,
  calendar::{FillPolicy, Frequency},
  interval::{TimeInterval, Timestamp},
  report::{RemoveReport, UpdateReport},
  row::Row,
};

/// Cooperative cancellation signal. Sending `true` stops pairs that have not
/// started yet.
pub type Cancel = watch::Receiver<bool>;

pub(crate) fn is_cancelled(cancel: Option<&Cancel>) -> bool {
  cancel.is_some_and(|rx| *rx.borrow())
}

#[derive(Debug, Clone)]
pub struct QueryParams {
  pub entities:     Vec<String>,
  pub fields:       Vec<String>,
  pub start:        Timestamp,
  /// Exclusive.
  pub end:          Timestamp,
  /// `None` returns every stored observation in range; otherwise only rows
  /// on the grid dates, with `fill` applied.
  pub frequency:    Option<Frequency>,
  pub fill:         FillPolicy,
  /// Clear existing coverage for the range first, forcing a full re-fetch.
  pub force_update: bool,
  /// Bring coverage up to date and return no rows.
  pub update_only:  bool,
  pub cancel:       Option<Cancel>,
}

impl QueryParams {
  pub fn new<E, F>(entities: E, fields: F, start: Timestamp, end: Timestamp) -> Self
  where
    E: IntoIterator,
    E::Item: Into<String>,
    F: IntoIterator,
    F::Item: Into<String>,
  {
    Self {
      entities: entities.into_iter().map(Into::into).collect(),
      fields: fields.into_iter().map(Into::into).collect(),
      start,
      end,
      frequency: None,
      fill: FillPolicy::None,
      force_update: false,
      update_only: false,
      cancel: None,
    }
  }

  pub fn frequency(mut self, frequency: Frequency) -> Self {
    self.frequency = Some(frequency);
    self
  }

  pub fn fill(mut self, fill: FillPolicy) -> Self {
    self.fill = fill;
    self
  }

  pub fn force_update(mut self, force: bool) -> Self {
    self.force_update = force;
    self
  }

  pub fn update_only(mut self, update_only: bool) -> Self {
    self.update_only = update_only;
    self
  }

  pub fn cancel(mut self, cancel: Cancel) -> Self {
    self.cancel = Some(cancel);
    self
  }

  /// The requested range, after checking the request is well formed.
  pub fn validate(&self) -> Result<TimeInterval> {
    let range = TimeInterval::new(self.start, self.end)?;
    validate_names(&self.entities, &self.fields)?;
    Ok(range)
  }
}

pub(crate) fn validate_names(entities: &[String], fields: &[String]) -> Result<()> {
  if entities.is_empty() {
    return Err(Error::InvalidRequest("no entities requested".into()));
  }
  if fields.is_empty() {
    return Err(Error::InvalidRequest("no fields requested".into()));
  }
  if let Some(bad) = entities.iter().chain(fields).find(|s| s.is_empty()) {
    return Err(Error::InvalidRequest(format!("empty name in request: {bad:?}")));
  }
  Ok(())
}

/// Rows read back after the coverage step, with what that step did.
#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
  pub rows:    Vec<Row>,
  pub update:  UpdateReport,
  /// Present when `force_update` cleared coverage first.
  pub removed: Option<RemoveReport>,
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};

  use super::*;

  #[test]
  fn rejects_inverted_range() {
    let a = Utc.with_ymd_and_hms(2020, 1, 10, 0, 0, 0).unwrap();
    let b = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let err = QueryParams::new(["a"], ["close"], a, b).validate().unwrap_err();
    assert!(matches!(err, Error::InvalidRange { .. }));
  }

  #[test]
  fn rejects_empty_entity_list() {
    let a = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let err = QueryParams::new(Vec::<String>::new(), ["close"], a, a)
      .validate()
      .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
  }

  #[test]
  fn cancel_reads_latest_value() {
    let (tx, rx) = watch::channel(false);
    assert!(!is_cancelled(Some(&rx)));
    tx.send(true).unwrap();
    assert!(is_cancelled(Some(&rx)));
    assert!(!is_cancelled(None));
  }
}
