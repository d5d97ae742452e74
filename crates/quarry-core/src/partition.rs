//! Year-partitioned row storage for one collection.
//!
//! Rows live in the partition of their timestamp's calendar year. Range reads
//! fan out over the years the range touches and concatenate the results;
//! writes are grouped by year and upserted per partition.

use std::{
  collections::{BTreeMap, BTreeSet, HashSet},
  sync::Arc,
};

use chrono::{Datelike, NaiveDate};
use tracing::debug;

use crate::{
  Error, Result,
  calendar::{Direction, FillPolicy, Frequency},
  interval::{TimeInterval, Timestamp},
  row::{Row, RowFilter},
  store::DocumentStore,
};

pub struct PartitionedStore<S> {
  store:      Arc<S>,
  collection: String,
}

impl<S: DocumentStore> PartitionedStore<S> {
  pub fn new(store: Arc<S>, collection: impl Into<String>) -> Self {
    Self { store, collection: collection.into() }
  }

  pub fn collection(&self) -> &str { &self.collection }

  /// Years with a partition, ascending.
  pub async fn partitions(&self) -> Result<Vec<i32>> {
    let mut years = self
      .store
      .partitions(&self.collection)
      .await
      .map_err(Error::storage_read)?;
    years.sort_unstable();
    Ok(years)
  }

  // ── Writes ────────────────────────────────────────────────────────────────

  /// Route rows to their year partitions and upsert them. Re-inserting the
  /// same rows leaves the partitions unchanged.
  pub async fn insert(&self, rows: Vec<Row>) -> Result<usize> {
    let mut by_year: BTreeMap<i32, Vec<Row>> = BTreeMap::new();
    for row in rows {
      by_year.entry(row.year()).or_default().push(row);
    }
    let mut written = 0;
    for (year, group) in by_year {
      written += self
        .store
        .upsert_rows(&self.collection, year, group)
        .await
        .map_err(Error::storage_write)?;
    }
    Ok(written)
  }

  /// Clear `field` on the entity's rows in `range`, keeping the rows.
  pub async fn unset_field(&self, entity: &str, field: &str, range: TimeInterval) -> Result<usize> {
    let mut touched = 0;
    for piece in range.split_years() {
      touched += self
        .store
        .unset_field(&self.collection, piece.min().year(), entity, field, piece)
        .await
        .map_err(Error::storage_write)?;
    }
    Ok(touched)
  }

  /// Clear `field` on every row of every partition.
  pub async fn drop_field(&self, field: &str) -> Result<usize> {
    let mut touched = 0;
    for year in self.partitions().await? {
      touched += self
        .store
        .drop_field(&self.collection, year, field)
        .await
        .map_err(Error::storage_write)?;
    }
    Ok(touched)
  }

  // ── Reads ─────────────────────────────────────────────────────────────────

  /// Rows in `range`, ordered by `(timestamp, entity)`.
  ///
  /// `entities = None` matches every entity; `fields = None` returns every
  /// stored field.
  pub async fn query(
    &self,
    entities: Option<&[String]>,
    range: TimeInterval,
    fields: Option<&[String]>,
  ) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for piece in range.split_years() {
      let filter = RowFilter::range(entities.map(<[String]>::to_vec), piece)
        .with_fields(fields.map(<[String]>::to_vec));
      rows.extend(self.find(piece.min().year(), &filter).await?);
    }
    sort_rows(&mut rows);
    Ok(rows)
  }

  /// Rows stamped exactly at one of `dates`.
  pub async fn query_dates(
    &self,
    entities: Option<&[String]>,
    dates: &[Timestamp],
    fields: Option<&[String]>,
  ) -> Result<Vec<Row>> {
    let mut by_year: BTreeMap<i32, Vec<Timestamp>> = BTreeMap::new();
    for date in dates {
      by_year.entry(date.year()).or_default().push(*date);
    }
    let mut rows = Vec::new();
    for (year, at) in by_year {
      let filter = RowFilter::at(entities.map(<[String]>::to_vec), at)
        .with_fields(fields.map(<[String]>::to_vec));
      rows.extend(self.find(year, &filter).await?);
    }
    sort_rows(&mut rows);
    Ok(rows)
  }

  /// Rows in `range` at `frequency`, with missing grid points filled per
  /// `fill`.
  ///
  /// Daily and business-daily reads return every observation in the range,
  /// intraday ones included. Coarser frequencies read only their grid points.
  pub async fn query_frequency(
    &self,
    entities: Option<&[String]>,
    range: TimeInterval,
    frequency: Frequency,
    fill: FillPolicy,
    fields: Option<&[String]>,
  ) -> Result<Vec<Row>> {
    let grid = frequency.grid(range.min(), range.max());
    if !frequency.reads_range() {
      return self.query_grid(entities, &grid, frequency, fill, fields).await;
    }
    let rows = self.query(entities, range, fields).await?;
    if fill == FillPolicy::None {
      return Ok(rows);
    }
    self.fill(rows, entities, &grid, frequency, fill, fields).await
  }

  /// Rows on the grid points of `grid`, with missing points filled per
  /// `fill`.
  pub async fn query_grid(
    &self,
    entities: Option<&[String]>,
    grid: &[Timestamp],
    frequency: Frequency,
    fill: FillPolicy,
    fields: Option<&[String]>,
  ) -> Result<Vec<Row>> {
    let rows = self.query_dates(entities, grid, fields).await?;
    if fill == FillPolicy::None {
      return Ok(rows);
    }
    self.fill(rows, entities, grid, frequency, fill, fields).await
  }

  async fn find(&self, year: i32, filter: &RowFilter) -> Result<Vec<Row>> {
    self
      .store
      .find_rows(&self.collection, year, filter)
      .await
      .map_err(Error::storage_read)
  }

  /// For each grid point where an entity has no row that day, copy the
  /// nearest observation from within the neighbouring grid step.
  ///
  /// Forward fill looks back no further than the previous grid point
  /// (exclusive); backward fill looks ahead no further than the next one.
  /// Each attempt fills every entity observed at the nearest instant, then
  /// retries with only the entities still missing.
  async fn fill(
    &self,
    mut rows: Vec<Row>,
    entities: Option<&[String]>,
    grid: &[Timestamp],
    frequency: Frequency,
    fill: FillPolicy,
    fields: Option<&[String]>,
  ) -> Result<Vec<Row>> {
    let universe = match entities {
      Some(list) => list.to_vec(),
      None => self.distinct_entities().await?,
    };
    let present: HashSet<(String, NaiveDate)> = rows
      .iter()
      .map(|r| (r.entity.clone(), r.timestamp.date_naive()))
      .collect();

    for &date in grid {
      let day = date.date_naive();
      let mut missing: Vec<String> = universe
        .iter()
        .filter(|e| !present.contains(&((*e).clone(), day)))
        .cloned()
        .collect();
      let (direction, cutoff) = match fill {
        FillPolicy::None => break,
        FillPolicy::Forward => (Direction::Earlier, frequency.prev(date)),
        FillPolicy::Backward => (Direction::Later, frequency.next(date)),
      };

      while !missing.is_empty() {
        let Some(near) = self.nearest_timestamp(&missing, date, direction).await? else {
          break;
        };
        let within = match (direction, cutoff) {
          (_, None) => true,
          (Direction::Earlier, Some(limit)) => near > limit,
          (Direction::Later, Some(limit)) => near < limit,
        };
        if !within {
          break;
        }
        let found = self.query_dates(Some(&missing), &[near], fields).await?;
        if found.is_empty() {
          break;
        }
        let filled: HashSet<String> = found.iter().map(|r| r.entity.clone()).collect();
        rows.extend(found.into_iter().map(|mut r| {
          r.timestamp = date;
          r
        }));
        missing.retain(|e| !filled.contains(e));
      }
    }

    sort_rows(&mut rows);
    Ok(rows)
  }

  /// The nearest observation instant for any of `entities`, looking from
  /// `at` (inclusive) in `direction`, across partitions.
  pub async fn nearest_timestamp(
    &self,
    entities: &[String],
    at: Timestamp,
    direction: Direction,
  ) -> Result<Option<Timestamp>> {
    let years = self.partitions().await?;
    let ordered: Vec<i32> = match direction {
      Direction::Earlier => years.into_iter().rev().filter(|y| *y <= at.year()).collect(),
      Direction::Later => years.into_iter().filter(|y| *y >= at.year()).collect(),
    };
    for year in ordered {
      let found = self
        .store
        .nearest(&self.collection, year, entities, at, direction)
        .await
        .map_err(Error::storage_read)?;
      if found.is_some() {
        debug!(collection = %self.collection, year, "nearest observation found");
        return Ok(found);
      }
    }
    Ok(None)
  }

  pub async fn first_timestamp(&self) -> Result<Option<Timestamp>> {
    for year in self.partitions().await? {
      if let Some((first, _)) = self.bounds(year).await? {
        return Ok(Some(first));
      }
    }
    Ok(None)
  }

  pub async fn last_timestamp(&self) -> Result<Option<Timestamp>> {
    for year in self.partitions().await?.into_iter().rev() {
      if let Some((_, last)) = self.bounds(year).await? {
        return Ok(Some(last));
      }
    }
    Ok(None)
  }

  async fn bounds(&self, year: i32) -> Result<Option<(Timestamp, Timestamp)>> {
    self
      .store
      .bounds(&self.collection, year)
      .await
      .map_err(Error::storage_read)
  }

  /// Every entity with at least one row, sorted.
  pub async fn distinct_entities(&self) -> Result<Vec<String>> {
    let mut all = BTreeSet::new();
    for year in self.partitions().await? {
      all.extend(
        self
          .store
          .distinct_entities(&self.collection, year)
          .await
          .map_err(Error::storage_read)?,
      );
    }
    Ok(all.into_iter().collect())
  }

  pub async fn count(&self) -> Result<u64> {
    let mut total = 0;
    for year in self.partitions().await? {
      total += self
        .store
        .count_rows(&self.collection, year)
        .await
        .map_err(Error::storage_read)?;
    }
    Ok(total)
  }
}

fn sort_rows(rows: &mut [Row]) {
  rows.sort_by(|a, b| (a.timestamp, &a.entity).cmp(&(b.timestamp, &b.entity)));
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};
  use serde_json::json;

  use super::*;
  use crate::memory::MemoryStore;

  fn ts(y: i32, m: u32, d: u32) -> Timestamp {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
  }

  fn store() -> PartitionedStore<MemoryStore> {
    PartitionedStore::new(Arc::new(MemoryStore::new()), "prices")
  }

  fn names(list: &[&str]) -> Vec<String> { list.iter().map(|s| s.to_string()).collect() }

  #[tokio::test]
  async fn insert_routes_by_year_and_query_spans_years() {
    let p = store();
    p.insert(vec![
      Row::new("a", ts(2019, 12, 31)).with("close", 1.0),
      Row::new("a", ts(2020, 1, 2)).with("close", 2.0),
      Row::new("b", ts(2020, 1, 2)).with("close", 3.0),
    ])
    .await
    .unwrap();

    assert_eq!(p.partitions().await.unwrap(), vec![2019, 2020]);

    let range = TimeInterval::new(ts(2019, 12, 1), ts(2020, 2, 1)).unwrap();
    let rows = p.query(Some(&names(&["a"])), range, None).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].timestamp, ts(2019, 12, 31));
    assert_eq!(rows[1].get("close"), Some(&json!(2.0)));
  }

  #[tokio::test]
  async fn null_values_are_not_stored() {
    let p = store();
    let row = Row::new("a", ts(2020, 1, 2))
      .with("close", 2.0)
      .with("open", serde_json::Value::Null);
    p.insert(vec![row.clone()]).await.unwrap();
    let range = TimeInterval::new(ts(2020, 1, 1), ts(2020, 1, 3)).unwrap();
    let first = p.query(None, range, None).await.unwrap();
    assert_eq!(first[0].get("open"), None);

    p.insert(vec![row]).await.unwrap();
    assert_eq!(p.query(None, range, None).await.unwrap(), first);
  }

  #[tokio::test]
  async fn upsert_is_idempotent_and_merges_fields() {
    let p = store();
    let row = Row::new("a", ts(2020, 1, 2)).with("close", 2.0);
    p.insert(vec![row.clone()]).await.unwrap();
    p.insert(vec![row]).await.unwrap();
    p.insert(vec![Row::new("a", ts(2020, 1, 2)).with("open", 1.5)])
      .await
      .unwrap();

    assert_eq!(p.count().await.unwrap(), 1);
    let range = TimeInterval::new(ts(2020, 1, 1), ts(2020, 1, 3)).unwrap();
    let rows = p.query(None, range, None).await.unwrap();
    assert_eq!(rows[0].get("close"), Some(&json!(2.0)));
    assert_eq!(rows[0].get("open"), Some(&json!(1.5)));
  }

  #[tokio::test]
  async fn unset_field_keeps_rows_and_other_fields() {
    let p = store();
    p.insert(vec![
      Row::new("a", ts(2020, 1, 2)).with("close", 2.0).with("open", 1.0),
      Row::new("a", ts(2020, 1, 9)).with("close", 3.0),
    ])
    .await
    .unwrap();

    let cleared = TimeInterval::new(ts(2020, 1, 1), ts(2020, 1, 5)).unwrap();
    assert_eq!(p.unset_field("a", "close", cleared).await.unwrap(), 1);

    let all = TimeInterval::new(ts(2020, 1, 1), ts(2020, 2, 1)).unwrap();
    let rows = p.query(None, all, None).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("close"), None);
    assert_eq!(rows[0].get("open"), Some(&json!(1.0)));
    assert_eq!(rows[1].get("close"), Some(&json!(3.0)));
  }

  #[tokio::test]
  async fn nearest_crosses_partitions() {
    let p = store();
    p.insert(vec![Row::new("a", ts(2018, 6, 1)).with("close", 1.0)])
      .await
      .unwrap();
    p.insert(vec![Row::new("b", ts(2020, 6, 1)).with("close", 1.0)])
      .await
      .unwrap();

    let a = names(&["a"]);
    assert_eq!(
      p.nearest_timestamp(&a, ts(2020, 1, 1), Direction::Earlier).await.unwrap(),
      Some(ts(2018, 6, 1)),
    );
    assert_eq!(
      p.nearest_timestamp(&a, ts(2020, 1, 1), Direction::Later).await.unwrap(),
      None,
    );
    assert_eq!(p.first_timestamp().await.unwrap(), Some(ts(2018, 6, 1)));
    assert_eq!(p.last_timestamp().await.unwrap(), Some(ts(2020, 6, 1)));
    assert_eq!(p.distinct_entities().await.unwrap(), names(&["a", "b"]));
  }

  #[tokio::test]
  async fn forward_fill_uses_last_observation_in_step() {
    let p = store();
    // Month-end 2020-05-31 is a Sunday; last observation is Friday the 29th.
    p.insert(vec![
      Row::new("a", ts(2020, 4, 30)).with("close", 1.0),
      Row::new("a", ts(2020, 5, 29)).with("close", 2.0),
      Row::new("b", ts(2020, 4, 30)).with("close", 5.0),
    ])
    .await
    .unwrap();

    let grid = Frequency::MonthEnd.grid(ts(2020, 4, 1), ts(2020, 6, 1));
    let rows = p
      .query_grid(
        Some(&names(&["a", "b"])),
        &grid,
        Frequency::MonthEnd,
        FillPolicy::Forward,
        None,
      )
      .await
      .unwrap();

    let may: Vec<&Row> = rows.iter().filter(|r| r.timestamp == ts(2020, 5, 31)).collect();
    assert_eq!(may.len(), 1, "b has nothing after April and stays missing");
    assert_eq!(may[0].entity, "a");
    assert_eq!(may[0].get("close"), Some(&json!(2.0)));
  }

  #[tokio::test]
  async fn daily_reads_intraday_rows_and_fills_empty_days() {
    let p = store();
    let morning = Utc.with_ymd_and_hms(2020, 1, 2, 10, 0, 0).unwrap();
    p.insert(vec![Row::new("a", morning).with("close", 1.0)]).await.unwrap();
    let a = names(&["a"]);

    let day = TimeInterval::new(ts(2020, 1, 2), ts(2020, 1, 3)).unwrap();
    for frequency in [Frequency::Daily, Frequency::BusinessDaily] {
      let rows = p
        .query_frequency(Some(&a), day, frequency, FillPolicy::None, None)
        .await
        .unwrap();
      assert_eq!(rows.len(), 1, "{frequency:?}");
      assert_eq!(rows[0].timestamp, morning);
    }

    let two_days = TimeInterval::new(ts(2020, 1, 2), ts(2020, 1, 4)).unwrap();
    let rows = p
      .query_frequency(Some(&a), two_days, Frequency::Daily, FillPolicy::Forward, None)
      .await
      .unwrap();
    let stamps: Vec<Timestamp> = rows.iter().map(|r| r.timestamp).collect();
    assert_eq!(stamps, vec![morning, ts(2020, 1, 3)]);
    assert_eq!(rows[1].get("close"), Some(&json!(1.0)));
  }

  #[tokio::test]
  async fn monthly_reads_only_grid_points() {
    let p = store();
    p.insert(vec![
      Row::new("a", ts(2020, 1, 15)).with("close", 1.0),
      Row::new("a", ts(2020, 1, 31)).with("close", 2.0),
    ])
    .await
    .unwrap();
    let range = TimeInterval::new(ts(2020, 1, 1), ts(2020, 2, 1)).unwrap();
    let rows = p
      .query_frequency(None, range, Frequency::MonthEnd, FillPolicy::None, None)
      .await
      .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].timestamp, ts(2020, 1, 31));
  }

  #[tokio::test]
  async fn backward_fill_recurses_over_remaining_entities() {
    let p = store();
    p.insert(vec![
      Row::new("a", ts(2020, 1, 2)).with("close", 1.0),
      Row::new("b", ts(2020, 1, 3)).with("close", 2.0),
    ])
    .await
    .unwrap();

    // Weekly grid point Sunday 2019-12-29; next one is 2020-01-05.
    let grid = vec![ts(2019, 12, 29)];
    let rows = p
      .query_grid(
        Some(&names(&["a", "b"])),
        &grid,
        Frequency::Weekly,
        FillPolicy::Backward,
        None,
      )
      .await
      .unwrap();

    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.timestamp == ts(2019, 12, 29)));
    assert_eq!(rows[0].get("close"), Some(&json!(1.0)));
    assert_eq!(rows[1].get("close"), Some(&json!(2.0)));
  }
}
