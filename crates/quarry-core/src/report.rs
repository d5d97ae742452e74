//! What an `update` or `remove` call did, pair by pair.

use serde::Serialize;

use crate::interval::TimeInterval;

/// Result of processing one gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GapOutcome {
  /// Rows were written; coverage grew by their observed extent.
  Fetched { rows: usize },
  /// Nothing returned for a closed gap; the whole gap is now covered.
  ConfirmedEmpty,
  /// Nothing returned for the trailing gap; left uncovered for a later call.
  LeftOpen,
  /// The feeder or the row write failed; the gap stays uncovered.
  Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GapReport {
  pub interval: TimeInterval,
  /// Feeder invocations spent on this gap, retries included.
  pub attempts: u32,
  #[serde(flatten)]
  pub outcome:  GapOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairStatus {
  /// No gaps; nothing fetched.
  UpToDate,
  /// Every gap processed without a failure.
  Completed,
  /// Some gaps failed to fetch and were left open.
  Partial,
  /// A row write failed; remaining gaps were not attempted.
  Failed { reason: String },
  /// Not started before the request was cancelled.
  Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairReport {
  pub entity: String,
  pub field:  String,
  #[serde(flatten)]
  pub status: PairStatus,
  pub gaps:   Vec<GapReport>,
}

impl PairReport {
  pub(crate) fn new(entity: &str, field: &str, status: PairStatus) -> Self {
    Self {
      entity: entity.to_owned(),
      field: field.to_owned(),
      status,
      gaps: Vec::new(),
    }
  }

  pub fn succeeded(&self) -> bool {
    matches!(self.status, PairStatus::UpToDate | PairStatus::Completed)
  }

  pub fn feeder_calls(&self) -> u32 { self.gaps.iter().map(|g| g.attempts).sum() }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
  pub pairs: Vec<PairReport>,
}

impl UpdateReport {
  pub fn succeeded(&self) -> impl Iterator<Item = &PairReport> {
    self.pairs.iter().filter(|p| p.succeeded())
  }

  /// Pairs that did not finish: failed, partially fetched, or cancelled.
  pub fn skipped(&self) -> impl Iterator<Item = &PairReport> {
    self.pairs.iter().filter(|p| !p.succeeded())
  }

  pub fn feeder_calls(&self) -> u32 { self.pairs.iter().map(PairReport::feeder_calls).sum() }

  pub fn rows_written(&self) -> usize {
    self
      .pairs
      .iter()
      .flat_map(|p| &p.gaps)
      .map(|g| match g.outcome {
        GapOutcome::Fetched { rows } => rows,
        _ => 0,
      })
      .sum()
  }

  pub fn is_complete(&self) -> bool { self.pairs.iter().all(PairReport::succeeded) }

  pub fn pair(&self, entity: &str, field: &str) -> Option<&PairReport> {
    self
      .pairs
      .iter()
      .find(|p| p.entity == entity && p.field == field)
  }
}

/// Sub-ranges cleared for one pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovedPair {
  pub entity:       String,
  pub field:        String,
  pub cleared:      Vec<TimeInterval>,
  pub rows_cleared: usize,
  /// Set when a row write failed part-way; `cleared` lists what was done.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error:        Option<String>,
  /// Not started because the call was cancelled; nothing was cleared.
  #[serde(skip_serializing_if = "std::ops::Not::not")]
  pub cancelled:    bool,
}

impl RemovedPair {
  pub(crate) fn new(entity: &str, field: &str) -> Self {
    Self {
      entity:       entity.to_owned(),
      field:        field.to_owned(),
      cleared:      Vec::new(),
      rows_cleared: 0,
      error:        None,
      cancelled:    false,
    }
  }

  pub(crate) fn cancelled(entity: &str, field: &str) -> Self {
    Self { cancelled: true, ..Self::new(entity, field) }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoveReport {
  pub pairs: Vec<RemovedPair>,
}

impl RemoveReport {
  pub fn rows_cleared(&self) -> usize { self.pairs.iter().map(|p| p.rows_cleared).sum() }

  pub fn is_complete(&self) -> bool {
    self.pairs.iter().all(|p| p.error.is_none() && !p.cancelled)
  }
}
