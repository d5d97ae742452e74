//! Integration tests for `SqliteStore` against an in-memory database.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use quarry_core::{
  DynamicCollection, Row, TimeInterval, Timestamp,
  calendar::Direction,
  config::{CollectionConfig, FetchPolicy},
  feeder::{FeedError, FeedRequest, FnFeeder},
  interval::IntervalSet,
  ledger::{AuditLogEntry, Operation},
  row::RowFilter,
  store::DocumentStore,
};
use serde_json::json;

use crate::{Error, SqliteStore};

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn day(y: i32, m: u32, d: u32) -> Timestamp { Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap() }

fn iv(a: Timestamp, b: Timestamp) -> TimeInterval { TimeInterval::new(a, b).unwrap() }

fn names(list: &[&str]) -> Vec<String> { list.iter().map(|s| s.to_string()).collect() }

// ─── Coverage ledger ─────────────────────────────────────────────────────────

#[tokio::test]
async fn coverage_document_round_trip() {
  let s = store().await;
  assert!(s.load_coverage("prices", "a").await.unwrap().is_none());

  let close = IntervalSet::from_intervals([
    iv(day(2020, 1, 1), day(2020, 1, 4)),
    iv(day(2020, 1, 6), day(2020, 1, 10)),
  ]);
  let open = IntervalSet::from_intervals([iv(day(2020, 1, 1), day(2020, 2, 1))]);
  s.save_coverage("prices", "a", "close", &close).await.unwrap();
  s.save_coverage("prices", "a", "open", &open).await.unwrap();

  let record = s.load_coverage("prices", "a").await.unwrap().unwrap();
  assert_eq!(record.entity, "a");
  assert_eq!(record.field("close"), close);
  assert_eq!(record.field("open"), open);

  // Overwrite one field in place.
  s.save_coverage("prices", "a", "close", &IntervalSet::new()).await.unwrap();
  let record = s.load_coverage("prices", "a").await.unwrap().unwrap();
  assert!(record.field("close").is_empty());
  assert_eq!(record.field("open"), open);
}

#[tokio::test]
async fn unset_coverage_reports_missing_document() {
  let s = store().await;
  assert!(!s.unset_coverage("prices", "a", &names(&["close"])).await.unwrap());

  let set = IntervalSet::from_intervals([iv(day(2020, 1, 1), day(2020, 1, 4))]);
  s.save_coverage("prices", "a", "close", &set).await.unwrap();
  s.save_coverage("prices", "a", "open", &set).await.unwrap();
  assert!(s.unset_coverage("prices", "a", &names(&["close"])).await.unwrap());

  let record = s.load_coverage("prices", "a").await.unwrap().unwrap();
  assert!(!record.fields.contains_key("close"));
  assert!(record.fields.contains_key("open"));
  assert_eq!(s.coverage_entities("prices").await.unwrap(), names(&["a"]));
}

#[tokio::test]
async fn collections_are_separate() {
  let s = store().await;
  let set = IntervalSet::from_intervals([iv(day(2020, 1, 1), day(2020, 1, 4))]);
  s.save_coverage("prices", "a", "close", &set).await.unwrap();
  s.insert_field("prices", "close").await.unwrap();

  assert!(s.load_coverage("volumes", "a").await.unwrap().is_none());
  assert!(s.load_fields("volumes").await.unwrap().is_empty());
}

// ─── Field registry ──────────────────────────────────────────────────────────

#[tokio::test]
async fn field_registry_is_idempotent() {
  let s = store().await;
  s.insert_field("prices", "close").await.unwrap();
  s.insert_field("prices", "close").await.unwrap();
  s.insert_field("prices", "open").await.unwrap();
  assert_eq!(s.load_fields("prices").await.unwrap(), names(&["close", "open"]));

  s.delete_field("prices", "close").await.unwrap();
  assert_eq!(s.load_fields("prices").await.unwrap(), names(&["open"]));
}

#[tokio::test]
async fn quoted_field_names_are_rejected() {
  let s = store().await;
  let err = s.insert_field("prices", "bad\"field").await.unwrap_err();
  assert!(matches!(err, Error::InvalidName(_)));
}

// ─── Audit log ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn audit_log_appends_and_filters() {
  let s = store().await;
  let range = iv(day(2020, 1, 1), day(2020, 1, 5));
  let entries = vec![
    AuditLogEntry::new(Operation::Insert, "a", "close", range),
    AuditLogEntry::new(Operation::Insert, "b", "close", range),
    AuditLogEntry::new(Operation::Remove, "a", "close", range),
  ];
  s.append_log("prices", &entries).await.unwrap();

  let all = s.read_log("prices", None).await.unwrap();
  assert_eq!(all.len(), 3);
  assert_eq!(all[0].entry_id, entries[0].entry_id);

  let only_a = s.read_log("prices", Some("a")).await.unwrap();
  assert_eq!(only_a.len(), 2);
  assert_eq!(only_a[1].operation, Operation::Remove);
  assert_eq!(only_a[1].interval, range);
}

// ─── Partitions ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn upsert_merges_values_by_key() {
  let s = store().await;
  let ts = day(2020, 1, 2);
  s.upsert_rows("prices", 2020, vec![Row::new("a", ts).with("close", 1.0)])
    .await
    .unwrap();
  s.upsert_rows("prices", 2020, vec![Row::new("a", ts).with("open", 2.0)])
    .await
    .unwrap();
  s.upsert_rows("prices", 2020, vec![Row::new("a", ts).with("close", 1.5)])
    .await
    .unwrap();

  assert_eq!(s.count_rows("prices", 2020).await.unwrap(), 1);
  let rows = s
    .find_rows("prices", 2020, &RowFilter::range(None, iv(ts, day(2020, 1, 3))))
    .await
    .unwrap();
  assert_eq!(rows[0].get("close"), Some(&json!(1.5)));
  assert_eq!(rows[0].get("open"), Some(&json!(2.0)));
  assert_eq!(s.partitions("prices").await.unwrap(), vec![2020]);
}

#[tokio::test]
async fn null_values_are_not_stored_and_upsert_is_idempotent() {
  let s = store().await;
  let ts = day(2020, 1, 2);
  let batch = vec![Row::new("a", ts).with("close", 1.0).with("open", serde_json::Value::Null)];
  let filter = RowFilter::range(None, iv(ts, day(2020, 1, 3)));

  s.upsert_rows("prices", 2020, batch.clone()).await.unwrap();
  let first = s.find_rows("prices", 2020, &filter).await.unwrap();
  assert_eq!(first[0].get("open"), None);
  assert_eq!(first[0].get("close"), Some(&json!(1.0)));

  s.upsert_rows("prices", 2020, batch).await.unwrap();
  assert_eq!(s.find_rows("prices", 2020, &filter).await.unwrap(), first);

  // A null never clears a stored value.
  s.upsert_rows("prices", 2020, vec![Row::new("a", ts).with("close", serde_json::Value::Null)])
    .await
    .unwrap();
  assert_eq!(s.find_rows("prices", 2020, &filter).await.unwrap(), first);
}

#[tokio::test]
async fn missing_partition_reads_as_empty() {
  let s = store().await;
  let filter = RowFilter::range(None, iv(day(2019, 1, 1), day(2019, 2, 1)));
  assert!(s.find_rows("prices", 2019, &filter).await.unwrap().is_empty());
  assert_eq!(s.count_rows("prices", 2019).await.unwrap(), 0);
  assert!(s.bounds("prices", 2019).await.unwrap().is_none());
}

#[tokio::test]
async fn find_rows_filters_and_projects() {
  let s = store().await;
  s.upsert_rows("prices", 2020, vec![
    Row::new("a", day(2020, 1, 2)).with("close", 1.0).with("open", 0.5),
    Row::new("b", day(2020, 1, 2)).with("close", 2.0),
    Row::new("a", day(2020, 1, 3)).with("close", 3.0),
  ])
  .await
  .unwrap();

  let filter = RowFilter::at(Some(names(&["a"])), vec![day(2020, 1, 2)])
    .with_fields(Some(names(&["close"])));
  let rows = s.find_rows("prices", 2020, &filter).await.unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].values.len(), 1);
  assert_eq!(rows[0].get("close"), Some(&json!(1.0)));

  assert_eq!(s.distinct_entities("prices", 2020).await.unwrap(), names(&["a", "b"]));
  assert_eq!(
    s.bounds("prices", 2020).await.unwrap(),
    Some((day(2020, 1, 2), day(2020, 1, 3))),
  );
}

#[tokio::test]
async fn unset_and_drop_clear_fields_not_rows() {
  let s = store().await;
  s.upsert_rows("prices", 2020, vec![
    Row::new("a", day(2020, 1, 2)).with("close", 1.0).with("open", 1.0),
    Row::new("a", day(2020, 1, 3)).with("close", 2.0).with("open", 1.0),
    Row::new("b", day(2020, 1, 2)).with("close", 3.0),
  ])
  .await
  .unwrap();

  let cleared = s
    .unset_field("prices", 2020, "a", "close", iv(day(2020, 1, 1), day(2020, 1, 3)))
    .await
    .unwrap();
  assert_eq!(cleared, 1);

  let all = RowFilter::range(None, iv(day(2020, 1, 1), day(2020, 2, 1)));
  let rows = s.find_rows("prices", 2020, &all).await.unwrap();
  assert_eq!(rows.len(), 3);
  assert_eq!(rows[0].get("close"), None);
  assert_eq!(rows[0].get("open"), Some(&json!(1.0)));

  assert_eq!(s.drop_field("prices", 2020, "open").await.unwrap(), 2);
  let rows = s.find_rows("prices", 2020, &all).await.unwrap();
  assert!(rows.iter().all(|r| r.get("open").is_none()));
}

#[tokio::test]
async fn nearest_looks_both_ways() {
  let s = store().await;
  s.upsert_rows("prices", 2020, vec![
    Row::new("a", day(2020, 1, 2)).with("close", 1.0),
    Row::new("a", day(2020, 1, 9)).with("close", 1.0),
    Row::new("b", day(2020, 1, 5)).with("close", 1.0),
  ])
  .await
  .unwrap();

  let a = names(&["a"]);
  let at = day(2020, 1, 5);
  assert_eq!(
    s.nearest("prices", 2020, &a, at, Direction::Earlier).await.unwrap(),
    Some(day(2020, 1, 2)),
  );
  assert_eq!(
    s.nearest("prices", 2020, &a, at, Direction::Later).await.unwrap(),
    Some(day(2020, 1, 9)),
  );
  assert_eq!(
    s.nearest("prices", 2020, &names(&["a", "b"]), at, Direction::Earlier)
      .await
      .unwrap(),
    Some(at),
  );
  assert_eq!(
    s.nearest("prices", 2020, &a, day(2020, 1, 10), Direction::Later)
      .await
      .unwrap(),
    None,
  );
}

#[tokio::test]
async fn invalid_collection_name_is_rejected() {
  let s = store().await;
  let err = s
    .upsert_rows("bad-name", 2020, vec![Row::new("a", day(2020, 1, 1))])
    .await
    .unwrap_err();
  assert!(matches!(err, Error::InvalidName(_)));
}

// ─── Engine over SQLite ──────────────────────────────────────────────────────

#[tokio::test]
async fn incremental_update_persists_across_handles() {
  let s = Arc::new(store().await);
  let feeder = Arc::new(FnFeeder::new(|req: FeedRequest| async move {
    // Observations only on 2019-12-30 and 2020-01-02.
    let rows = [day(2019, 12, 30), day(2020, 1, 2)]
      .into_iter()
      .filter(|ts| req.contains(*ts))
      .map(|ts| Row::new(&req.entity, ts).with(&req.field, 10.0))
      .collect();
    Ok::<_, FeedError>(rows)
  }));
  let config = CollectionConfig::new("prices", "fixture");

  let c = DynamicCollection::new(s.clone(), config.clone(), feeder.clone(), FetchPolicy::default())
    .await
    .unwrap();
  let range = iv(day(2019, 12, 28), day(2020, 1, 6));
  let report = c.update(&names(&["a"]), &names(&["close"]), range).await.unwrap();
  assert_eq!(report.rows_written(), 2);
  assert_eq!(s.partitions("prices").await.unwrap(), vec![2019, 2020]);
  assert_eq!(c.coverage("a", "close").await.unwrap().to_pairs(), vec![(
    day(2019, 12, 30),
    day(2020, 1, 3)
  )]);

  // A second handle sees the same ledger and registry.
  let again = DynamicCollection::new(s.clone(), config, feeder, FetchPolicy::default())
    .await
    .unwrap();
  assert_eq!(again.fields().await, names(&["close"]));
  let report = again
    .update(&names(&["a"]), &names(&["close"]), iv(day(2019, 12, 30), day(2020, 1, 3)))
    .await
    .unwrap();
  assert_eq!(report.feeder_calls(), 0);

  let rows = again
    .partitions()
    .query(None, range, None)
    .await
    .unwrap();
  assert_eq!(rows.len(), 2);
  assert_eq!(again.audit_log(None).await.unwrap().len(), 1);
}
