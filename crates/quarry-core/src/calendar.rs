//! Calendar grids and read-side fill policies.

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::interval::Timestamp;

/// Spacing of a calendar grid. Grid points are midnight UTC.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
pub enum Frequency {
  /// Every calendar day.
  #[strum(serialize = "D")]
  #[serde(rename = "D")]
  Daily,
  /// Monday to Friday.
  #[strum(serialize = "B")]
  #[serde(rename = "B")]
  BusinessDaily,
  /// Sundays.
  #[strum(serialize = "W")]
  #[serde(rename = "W")]
  Weekly,
  /// Last calendar day of each month.
  #[strum(serialize = "M")]
  #[serde(rename = "M")]
  MonthEnd,
}

impl Frequency {
  pub fn is_grid_date(self, date: NaiveDate) -> bool {
    match self {
      Self::Daily => true,
      Self::BusinessDaily => !matches!(date.weekday(), Weekday::Sat | Weekday::Sun),
      Self::Weekly => date.weekday() == Weekday::Sun,
      Self::MonthEnd => date.succ_opt().is_none_or(|next| next.month() != date.month()),
    }
  }

  /// Whether a query at this frequency reads every observation in its range
  /// rather than only the grid points.
  pub fn reads_range(self) -> bool { matches!(self, Self::Daily | Self::BusinessDaily) }

  /// Grid points in `[start, end)`, ascending.
  pub fn grid(self, start: Timestamp, end: Timestamp) -> Vec<Timestamp> {
    let mut out = Vec::new();
    let mut date = start.date_naive();
    loop {
      let Some(point) = midnight(date) else { break };
      if point >= end {
        break;
      }
      if point >= start && self.is_grid_date(date) {
        out.push(point);
      }
      match date.succ_opt() {
        Some(next) => date = next,
        None => break,
      }
    }
    out
  }

  /// The last grid point strictly before the day of `ts`.
  pub fn prev(self, ts: Timestamp) -> Option<Timestamp> {
    let mut date = ts.date_naive().pred_opt()?;
    while !self.is_grid_date(date) {
      date = date.pred_opt()?;
    }
    midnight(date)
  }

  /// The first grid point strictly after the day of `ts`.
  pub fn next(self, ts: Timestamp) -> Option<Timestamp> {
    let mut date = ts.date_naive().succ_opt()?;
    while !self.is_grid_date(date) {
      date = date.succ_opt()?;
    }
    midnight(date)
  }
}

fn midnight(date: NaiveDate) -> Option<Timestamp> {
  date.and_hms_opt(0, 0, 0).map(|n| n.and_utc())
}

/// How grid points with no observation are filled on read.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FillPolicy {
  #[default]
  None,
  /// Copy the nearest earlier observation forward.
  #[strum(to_string = "forward", serialize = "ffill")]
  Forward,
  /// Copy the nearest later observation backward.
  #[strum(to_string = "backward", serialize = "bfill")]
  Backward,
}

/// Which way to look for the nearest observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  /// Latest observation at or before the instant.
  Earlier,
  /// Earliest observation at or after the instant.
  Later,
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};

  use super::*;

  fn ts(y: i32, m: u32, d: u32) -> Timestamp {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
  }

  #[test]
  fn business_grid_skips_weekends() {
    // 2020-01-03 is a Friday.
    let grid = Frequency::BusinessDaily.grid(ts(2020, 1, 3), ts(2020, 1, 8));
    assert_eq!(grid, vec![ts(2020, 1, 3), ts(2020, 1, 6), ts(2020, 1, 7)]);
  }

  #[test]
  fn month_end_grid() {
    let grid = Frequency::MonthEnd.grid(ts(2020, 1, 15), ts(2020, 4, 1));
    assert_eq!(grid, vec![ts(2020, 1, 31), ts(2020, 2, 29), ts(2020, 3, 31)]);
  }

  #[test]
  fn grid_excludes_partial_first_day() {
    let start = Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap();
    assert_eq!(Frequency::Daily.grid(start, ts(2020, 1, 3)), vec![ts(2020, 1, 2)]);
  }

  #[test]
  fn neighbours_are_strict() {
    assert_eq!(Frequency::BusinessDaily.prev(ts(2020, 1, 6)), Some(ts(2020, 1, 3)));
    assert_eq!(Frequency::BusinessDaily.next(ts(2020, 1, 3)), Some(ts(2020, 1, 6)));
    assert_eq!(Frequency::Weekly.next(ts(2020, 1, 5)), Some(ts(2020, 1, 12)));
  }

  #[test]
  fn parses_short_codes() {
    assert_eq!("B".parse::<Frequency>().unwrap(), Frequency::BusinessDaily);
    assert_eq!("ffill".parse::<FillPolicy>().unwrap(), FillPolicy::Forward);
    assert_eq!("none".parse::<FillPolicy>().unwrap(), FillPolicy::None);
    assert!("hourly".parse::<Frequency>().is_err());
  }
}
