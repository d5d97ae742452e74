//! A feeder over a directory of `<entity>.jsonl` files.
//!
//! Each line is one observation: `{"timestamp": "2020-01-02T00:00:00Z",
//! "close": 10.5, "open": 10.1}`. A file is read once per call and shared by
//! every field requested for that entity through the [`FetchCache`].

use std::{collections::BTreeMap, io::ErrorKind, path::PathBuf};

use async_trait::async_trait;
use quarry_core::{
  Row, Timestamp,
  feeder::{FeedError, FeedRequest, Feeder, FetchCache},
};
use serde::Deserialize;
use tracing::debug;

#[derive(Deserialize)]
struct Record {
  timestamp: Timestamp,
  #[serde(flatten)]
  values:    BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct JsonlFeeder {
  dir: PathBuf,
}

impl JsonlFeeder {
  pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

  /// Every record in the entity's file. A missing file is an empty source.
  async fn read_entity(&self, entity: &str) -> Result<Vec<Row>, FeedError> {
    if entity.contains(['/', '\\']) || entity.starts_with('.') {
      return Err(FeedError::permanent(format!("entity {entity:?} is not a file name")));
    }
    let path = self.dir.join(format!("{entity}.jsonl"));
    let text = match tokio::fs::read_to_string(&path).await {
      Ok(text) => text,
      Err(e) if e.kind() == ErrorKind::NotFound => {
        debug!(path = %path.display(), "no data file");
        return Ok(Vec::new());
      }
      Err(e) => return Err(FeedError::transient(format!("{}: {e}", path.display()))),
    };

    let mut rows = Vec::new();
    for (n, line) in text.lines().enumerate() {
      if line.trim().is_empty() {
        continue;
      }
      let record: Record = serde_json::from_str(line).map_err(|e| {
        FeedError::permanent(format!("{}:{}: {e}", path.display(), n + 1))
      })?;
      rows.push(Row { entity: entity.to_owned(), timestamp: record.timestamp, values: record.values });
    }
    debug!(path = %path.display(), rows = rows.len(), "read data file");
    Ok(rows)
  }
}

#[async_trait]
impl Feeder for JsonlFeeder {
  async fn fetch(&self, request: &FeedRequest, cache: &FetchCache) -> Result<Vec<Row>, FeedError> {
    let batch = cache
      .get_or_try_load(&request.source, &request.entity, || self.read_entity(&request.entity))
      .await?;

    let field = std::slice::from_ref(&request.field);
    Ok(
      batch
        .iter()
        .filter(|row| request.contains(row.timestamp) && row.get(&request.field).is_some())
        .map(|row| row.clone().project(field))
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use std::fs;

  use chrono::{TimeZone, Utc};
  use quarry_core::TimeInterval;
  use serde_json::json;

  use super::*;

  fn day(d: u32) -> Timestamp { Utc.with_ymd_and_hms(2020, 1, d, 0, 0, 0).unwrap() }

  fn request(entity: &str, field: &str, a: u32, b: u32) -> FeedRequest {
    FeedRequest::new("jsonl", entity, field, TimeInterval::new(day(a), day(b)).unwrap())
  }

  fn fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
      dir.path().join("AAA.jsonl"),
      concat!(
        "{\"timestamp\": \"2020-01-02T00:00:00Z\", \"close\": 1.0, \"open\": 0.5}\n",
        "\n",
        "{\"timestamp\": \"2020-01-03T00:00:00Z\", \"close\": 2.0}\n",
        "{\"timestamp\": \"2020-01-06T00:00:00Z\", \"close\": 3.0, \"open\": 2.5}\n",
      ),
    )
    .unwrap();
    dir
  }

  #[tokio::test]
  async fn returns_requested_field_in_range() {
    let dir = fixture();
    let feeder = JsonlFeeder::new(dir.path());
    let cache = FetchCache::new();

    let rows = feeder.fetch(&request("AAA", "close", 1, 4), &cache).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].timestamp, day(3));
    assert_eq!(rows[1].get("close"), Some(&json!(2.0)));
    assert!(rows.iter().all(|r| r.get("open").is_none()));

    let rows = feeder.fetch(&request("AAA", "open", 1, 10), &cache).await.unwrap();
    assert_eq!(rows.iter().map(|r| r.timestamp).collect::<Vec<_>>(), vec![day(2), day(6)]);
    assert_eq!(cache.len(), 1);
  }

  #[tokio::test]
  async fn batch_is_read_once_per_call() {
    let dir = fixture();
    let feeder = JsonlFeeder::new(dir.path());
    let cache = FetchCache::new();
    feeder.fetch(&request("AAA", "close", 1, 10), &cache).await.unwrap();

    // Later edits to the file are not seen within the same cache.
    fs::remove_file(dir.path().join("AAA.jsonl")).unwrap();
    let rows = feeder.fetch(&request("AAA", "open", 1, 10), &cache).await.unwrap();
    assert_eq!(rows.len(), 2);
  }

  #[tokio::test]
  async fn missing_file_is_empty() {
    let dir = fixture();
    let feeder = JsonlFeeder::new(dir.path());
    let rows = feeder
      .fetch(&request("BBB", "close", 1, 10), &FetchCache::new())
      .await
      .unwrap();
    assert!(rows.is_empty());
  }

  #[tokio::test]
  async fn malformed_line_is_permanent() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("AAA.jsonl"), "{\"close\": 1.0}\n").unwrap();
    let feeder = JsonlFeeder::new(dir.path());
    let err = feeder
      .fetch(&request("AAA", "close", 1, 10), &FetchCache::new())
      .await
      .unwrap_err();
    assert!(!err.is_transient());
  }

  #[tokio::test]
  async fn path_like_entities_are_rejected() {
    let dir = fixture();
    let feeder = JsonlFeeder::new(dir.path());
    let err = feeder
      .fetch(&request("../AAA", "close", 1, 10), &FetchCache::new())
      .await
      .unwrap_err();
    assert!(!err.is_transient());
  }
}
