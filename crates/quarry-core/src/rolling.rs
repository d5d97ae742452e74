//! Trailing windows over a calendar grid.

use std::collections::VecDeque;

use chrono::TimeDelta;

use crate::{
  Result,
  calendar::{FillPolicy, Frequency},
  interval::{TimeInterval, Timestamp},
  partition::PartitionedStore,
  row::Row,
  store::DocumentStore,
};

/// Parameters for [`PartitionedStore::rolling`].
#[derive(Debug, Clone)]
pub struct RollingSpec {
  /// Non-empty steps per window.
  pub window:    usize,
  pub frequency: Frequency,
  pub fill:      FillPolicy,
  pub entities:  Option<Vec<String>>,
  pub fields:    Option<Vec<String>>,
  /// Defaults to the first stored observation.
  pub start:     Option<Timestamp>,
  /// Defaults to just past the last stored observation.
  pub end:       Option<Timestamp>,
  pub ascending: bool,
}

impl RollingSpec {
  pub fn new(window: usize, frequency: Frequency) -> Self {
    Self {
      window,
      frequency,
      fill: FillPolicy::None,
      entities: None,
      fields: None,
      start: None,
      end: None,
      ascending: true,
    }
  }
}

/// Lazily reads one grid step at a time and yields the concatenation of the
/// last `window` non-empty steps. Steps without rows are skipped and do not
/// count toward the window.
///
/// For daily and business-daily grids a step is every observation in
/// `(previous grid point, grid point]`. For coarser grids it is the rows on
/// the grid point itself, with `fill` applied.
pub struct RollingWindows<'a, S> {
  store:  &'a PartitionedStore<S>,
  spec:   RollingSpec,
  steps:  std::vec::IntoIter<Timestamp>,
  buffer: VecDeque<Vec<Row>>,
}

impl<S: DocumentStore> PartitionedStore<S> {
  pub async fn rolling(&self, spec: RollingSpec) -> Result<RollingWindows<'_, S>> {
    let start = match spec.start {
      Some(start) => Some(start),
      None => self.first_timestamp().await?,
    };
    let end = match spec.end {
      Some(end) => Some(end),
      None => self.last_timestamp().await?.map(|t| t + TimeDelta::days(1)),
    };
    let mut grid = match start.zip(end) {
      Some((start, end)) => spec.frequency.grid(start, end),
      None => Vec::new(),
    };
    if !spec.ascending {
      grid.reverse();
    }
    Ok(RollingWindows {
      store: self,
      spec,
      steps: grid.into_iter(),
      buffer: VecDeque::new(),
    })
  }
}

impl<S: DocumentStore> RollingWindows<'_, S> {
  /// The next full window, or `None` once the grid is exhausted.
  pub async fn next(&mut self) -> Option<Result<Vec<Row>>> {
    let window = self.spec.window.max(1);
    for point in self.steps.by_ref() {
      let rows = match step(self.store, &self.spec, point).await {
        Ok(rows) => rows,
        Err(e) => return Some(Err(e)),
      };
      if rows.is_empty() {
        continue;
      }
      self.buffer.push_back(rows);
      if self.buffer.len() == window {
        let out = self.buffer.iter().flatten().cloned().collect();
        self.buffer.pop_front();
        return Some(Ok(out));
      }
    }
    None
  }
}

async fn step<S: DocumentStore>(
  store: &PartitionedStore<S>,
  spec: &RollingSpec,
  point: Timestamp,
) -> Result<Vec<Row>> {
  let entities = spec.entities.as_deref();
  let fields = spec.fields.as_deref();
  match spec.frequency {
    Frequency::Daily | Frequency::BusinessDaily => {
      let from = spec
        .frequency
        .prev(point)
        .map_or(point, |prev| prev + TimeDelta::days(1));
      let range = TimeInterval::new(from, point + TimeDelta::days(1))?;
      store.query(entities, range, fields).await
    }
    Frequency::Weekly | Frequency::MonthEnd => {
      store
        .query_grid(entities, &[point], spec.frequency, spec.fill, fields)
        .await
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use chrono::{TimeZone, Utc};

  use super::*;
  use crate::memory::MemoryStore;

  fn ts(m: u32, d: u32) -> Timestamp { Utc.with_ymd_and_hms(2020, m, d, 0, 0, 0).unwrap() }

  async fn seeded() -> PartitionedStore<MemoryStore> {
    let p = PartitionedStore::new(Arc::new(MemoryStore::new()), "prices");
    // Thursday, Friday, Monday, Tuesday.
    let days = [ts(1, 2), ts(1, 3), ts(1, 6), ts(1, 7)];
    p.insert(
      days
        .iter()
        .enumerate()
        .map(|(i, d)| Row::new("a", *d).with("close", i as f64))
        .collect(),
    )
    .await
    .unwrap();
    p
  }

  async fn collect(mut windows: RollingWindows<'_, MemoryStore>) -> Vec<Vec<Timestamp>> {
    let mut out = Vec::new();
    while let Some(window) = windows.next().await {
      out.push(window.unwrap().iter().map(|r| r.timestamp).collect());
    }
    out
  }

  #[tokio::test]
  async fn ascending_business_windows() {
    let p = seeded().await;
    let windows = p.rolling(RollingSpec::new(2, Frequency::BusinessDaily)).await.unwrap();

    assert_eq!(collect(windows).await, vec![
      vec![ts(1, 2), ts(1, 3)],
      vec![ts(1, 3), ts(1, 6)],
      vec![ts(1, 6), ts(1, 7)],
    ]);
  }

  #[tokio::test]
  async fn descending_skips_empty_steps() {
    let p = seeded().await;
    let mut spec = RollingSpec::new(3, Frequency::Daily);
    spec.ascending = false;
    let windows = p.rolling(spec).await.unwrap();

    assert_eq!(collect(windows).await, vec![
      vec![ts(1, 7), ts(1, 6), ts(1, 3)],
      vec![ts(1, 6), ts(1, 3), ts(1, 2)],
    ]);
  }

  #[tokio::test]
  async fn empty_store_yields_nothing() {
    let p = PartitionedStore::new(Arc::new(MemoryStore::new()), "prices");
    let mut windows = p.rolling(RollingSpec::new(2, Frequency::Weekly)).await.unwrap();
    assert!(windows.next().await.is_none());
  }
}
