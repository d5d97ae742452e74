//! Interval algebra over half-open time ranges.
//!
//! A [`TimeInterval`] is `[min, max)`. An [`IntervalSet`] is the canonical
//! coverage of one (entity, field) pair: sorted, disjoint and maximally
//! coalesced, so two intervals that overlap or merely touch never coexist in
//! a set.
//!
//! On disk a set is a list of `[start, end)` pairs; the granularity is a
//! property of the owning collection and is not persisted.

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Every timestamp in the cache is a UTC instant.
pub type Timestamp = DateTime<Utc>;

/// Observation spacing assumed when nothing else is configured.
pub fn default_granularity() -> TimeDelta { TimeDelta::days(1) }

/// Midnight UTC on January 1st of `year`.
pub fn year_start(year: i32) -> Option<Timestamp> {
  NaiveDate::from_ymd_opt(year, 1, 1)
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|n| n.and_utc())
}

// ─── TimeInterval ────────────────────────────────────────────────────────────

/// A closed-open range `[min, max)` of instants.
///
/// `granularity` is the spacing of the observations this interval describes.
/// It only matters when an interval is derived from observed timestamps
/// ([`TimeInterval::observed`]); equality compares all three fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "(Timestamp, Timestamp)", try_from = "(Timestamp, Timestamp)")]
pub struct TimeInterval {
  min:         Timestamp,
  max:         Timestamp,
  granularity: TimeDelta,
}

impl TimeInterval {
  /// Build `[min, max)`. Fails with [`Error::InvalidRange`] if `min > max`.
  pub fn new(min: Timestamp, max: Timestamp) -> Result<Self> {
    if min > max {
      return Err(Error::InvalidRange { min, max });
    }
    Ok(Self { min, max, granularity: default_granularity() })
  }

  /// The extent actually covered by observations stamped `first..=last`:
  /// `[first, last + granularity)`.
  pub fn observed(
    first: Timestamp,
    last: Timestamp,
    granularity: TimeDelta,
  ) -> Result<Self> {
    if granularity <= TimeDelta::zero() {
      return Err(Error::InvalidRequest(format!("granularity must be positive, got {granularity}")));
    }
    let end = last
      .checked_add_signed(granularity)
      .ok_or_else(|| Error::InvalidRequest(format!("{last} + {granularity} is out of range")))?;
    Ok(Self::new(first, end)?.with_granularity(granularity))
  }

  pub fn with_granularity(mut self, granularity: TimeDelta) -> Self {
    self.granularity = granularity;
    self
  }

  pub fn min(&self) -> Timestamp { self.min }

  pub fn max(&self) -> Timestamp { self.max }

  pub fn granularity(&self) -> TimeDelta { self.granularity }

  pub fn duration(&self) -> TimeDelta { self.max - self.min }

  pub fn is_empty(&self) -> bool { self.min == self.max }

  pub fn contains(&self, ts: Timestamp) -> bool {
    self.min <= ts && ts < self.max
  }

  /// Overlapping or touching.
  ///
  /// Compares the distance between the two midpoints with the sum of the
  /// half-widths; both sides are doubled to stay in integer microseconds.
  pub fn mergeable(&self, other: &Self) -> bool {
    let (a_min, a_max) = micros(self);
    let (b_min, b_max) = micros(other);
    let mid_gap = ((a_min + a_max) - (b_min + b_max)).abs();
    mid_gap <= (a_max - a_min) + (b_max - b_min)
  }

  /// Union of the two intervals when mergeable, otherwise both unchanged.
  pub fn merge(self, other: Self) -> (Self, Option<Self>) {
    if !self.mergeable(&other) {
      return (self, Some(other));
    }
    let merged = Self {
      min:         self.min.min(other.min),
      max:         self.max.max(other.max),
      granularity: self.granularity.min(other.granularity),
    };
    (merged, None)
  }

  /// Subtract `other` from `self`.
  ///
  /// Returns the non-empty remainders `[self.min, other.min)` and
  /// `[other.max, self.max)`. When the two are not mergeable `self` comes
  /// back untouched in the first slot.
  pub fn carve(self, other: Self) -> (Option<Self>, Option<Self>) {
    if !self.mergeable(&other) {
      return (Some(self), None);
    }
    let left = Self { max: other.min, ..self };
    let right = Self { min: other.max, ..self };
    (
      (left.min < left.max).then_some(left),
      (right.min < right.max).then_some(right),
    )
  }

  /// The overlap of the two intervals, `None` if they share no instant.
  pub fn intersect(self, other: Self) -> Option<Self> {
    if !self.mergeable(&other) {
      return None;
    }
    let out = Self {
      min: self.min.max(other.min),
      max: self.max.min(other.max),
      ..self
    };
    (!out.is_empty()).then_some(out)
  }

  /// Split into consecutive pieces that never cross a calendar-year boundary.
  pub fn split_years(&self) -> Vec<Self> {
    let mut out = Vec::new();
    let mut cursor = self.min;
    while cursor < self.max {
      let end = year_start(cursor.year() + 1)
        .map(|next| next.min(self.max))
        .unwrap_or(self.max);
      out.push(Self { min: cursor, max: end, ..*self });
      cursor = end;
    }
    out
  }

  /// Calendar years touched by the interval, ascending.
  pub fn years(&self) -> impl Iterator<Item = i32> + '_ {
    self.split_years().into_iter().map(|piece| piece.min.year())
  }
}

fn micros(interval: &TimeInterval) -> (i128, i128) {
  (
    i128::from(interval.min.timestamp_micros()),
    i128::from(interval.max.timestamp_micros()),
  )
}

impl std::fmt::Display for TimeInterval {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "[{}, {})", self.min.to_rfc3339(), self.max.to_rfc3339())
  }
}

impl From<TimeInterval> for (Timestamp, Timestamp) {
  fn from(interval: TimeInterval) -> Self { (interval.min, interval.max) }
}

impl TryFrom<(Timestamp, Timestamp)> for TimeInterval {
  type Error = Error;

  fn try_from((min, max): (Timestamp, Timestamp)) -> Result<Self> {
    Self::new(min, max)
  }
}

// ─── IntervalSet ─────────────────────────────────────────────────────────────

/// Canonical coverage: sorted, disjoint, non-adjacent intervals.
///
/// Any insertion order of the same intervals yields the same set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<TimeInterval>", into = "Vec<TimeInterval>")]
pub struct IntervalSet {
  intervals: Vec<TimeInterval>,
}

impl IntervalSet {
  pub fn new() -> Self { Self::default() }

  pub fn from_intervals(intervals: impl IntoIterator<Item = TimeInterval>) -> Self {
    let mut set = Self { intervals: intervals.into_iter().collect() };
    set.coalesce();
    set
  }

  /// Rebuild a set from its persisted `[start, end)` pairs.
  pub fn from_pairs(
    pairs: impl IntoIterator<Item = (Timestamp, Timestamp)>,
  ) -> Result<Self> {
    let intervals = pairs
      .into_iter()
      .map(TimeInterval::try_from)
      .collect::<Result<Vec<_>>>()?;
    Ok(Self::from_intervals(intervals))
  }

  pub fn to_pairs(&self) -> Vec<(Timestamp, Timestamp)> {
    self.intervals.iter().copied().map(Into::into).collect()
  }

  pub fn is_empty(&self) -> bool { self.intervals.is_empty() }

  pub fn len(&self) -> usize { self.intervals.len() }

  pub fn iter(&self) -> std::slice::Iter<'_, TimeInterval> {
    self.intervals.iter()
  }

  pub fn contains(&self, ts: Timestamp) -> bool {
    self.intervals.iter().any(|i| i.contains(ts))
  }

  /// Whether `range` lies entirely inside a single element.
  pub fn covers(&self, range: &TimeInterval) -> bool {
    self
      .intervals
      .iter()
      .any(|i| i.min <= range.min && range.max <= i.max)
  }

  /// Add `interval` and re-coalesce.
  pub fn merge(&mut self, interval: TimeInterval) -> &mut Self {
    self.intervals.push(interval);
    self.coalesce();
    self
  }

  /// Remove `range` from every element and re-coalesce the survivors.
  pub fn carve(&mut self, range: TimeInterval) -> &mut Self {
    self.intervals = self
      .intervals
      .drain(..)
      .flat_map(|i| {
        let (left, right) = i.carve(range);
        left.into_iter().chain(right)
      })
      .collect();
    self.coalesce();
    self
  }

  /// The parts of the set that fall inside `range`.
  pub fn intersect(&self, range: TimeInterval) -> IntervalSet {
    Self::from_intervals(self.intervals.iter().filter_map(|i| i.intersect(range)))
  }

  /// The complement of the set within `range`, in chronological order.
  ///
  /// An empty set yields `range` itself as the only gap.
  pub fn gaps(&self, range: TimeInterval) -> Vec<TimeInterval> {
    if range.is_empty() {
      return Vec::new();
    }
    let mut gaps = Vec::new();
    let mut remaining = Some(range);
    for covered in &self.intervals {
      let Some(rest) = remaining else { break };
      if covered.max <= rest.min {
        continue;
      }
      if covered.min >= rest.max {
        break;
      }
      let (left, right) = rest.carve(*covered);
      gaps.extend(left);
      remaining = right;
    }
    gaps.extend(remaining);
    gaps
  }

  fn coalesce(&mut self) {
    self.intervals.retain(|i| !i.is_empty());
    self.intervals.sort_by_key(|i| (i.min, i.max));
    let mut out: Vec<TimeInterval> = Vec::with_capacity(self.intervals.len());
    for next in self.intervals.drain(..) {
      match out.last_mut() {
        Some(last) => match last.merge(next) {
          (merged, None) => *last = merged,
          (_, Some(next)) => out.push(next),
        },
        None => out.push(next),
      }
    }
    self.intervals = out;
  }
}

impl From<Vec<TimeInterval>> for IntervalSet {
  fn from(intervals: Vec<TimeInterval>) -> Self { Self::from_intervals(intervals) }
}

impl From<IntervalSet> for Vec<TimeInterval> {
  fn from(set: IntervalSet) -> Self { set.intervals }
}

impl<'a> IntoIterator for &'a IntervalSet {
  type Item = &'a TimeInterval;
  type IntoIter = std::slice::Iter<'a, TimeInterval>;

  fn into_iter(self) -> Self::IntoIter { self.intervals.iter() }
}
