//! [`SqliteStore`]: the SQLite implementation of [`DocumentStore`].

use std::path::Path;

use rusqlite::{OptionalExtension as _, types::Value};

use quarry_core::{
  calendar::Direction,
  interval::{IntervalSet, TimeInterval, Timestamp},
  ledger::{AuditLogEntry, CoverageRecord},
  row::{Row, RowFilter, TimeFilter},
  store::DocumentStore,
};

use crate::{
  Result,
  encode::{
    RawLogEntry, RawRow, check_collection, decode_fields, decode_ts, encode_dt,
    encode_intervals, encode_row, encode_ts, encode_uuid, json_path, partition_table,
  },
  schema::{SCHEMA, partition_ddl},
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A quarry document store backed by a single SQLite file.
///
/// Clones share one connection.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Name of the partition table, or `None` if it was never created.
  async fn existing_partition(&self, collection: &str, year: i32) -> Result<Option<String>> {
    let table = partition_table(collection, year)?;
    let collection = collection.to_owned();
    let exists = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT 1 FROM partitions WHERE collection = ?1 AND year = ?2",
              rusqlite::params![collection, year],
              |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false),
        )
      })
      .await?;
    Ok(exists.then_some(table))
  }
}

/// `?, ?, ...` with `n` placeholders.
fn placeholders(n: usize) -> String { vec!["?"; n].join(", ") }

/// WHERE clause and bound values for an entity/time filter.
fn filter_clause(entities: Option<&[String]>, time: &TimeFilter) -> (String, Vec<Value>) {
  let mut conds = Vec::new();
  let mut params = Vec::new();
  if let Some(entities) = entities {
    conds.push(format!("entity IN ({})", placeholders(entities.len())));
    params.extend(entities.iter().cloned().map(Value::Text));
  }
  match time {
    TimeFilter::All => {}
    TimeFilter::Range(range) => {
      conds.push("ts >= ? AND ts < ?".to_owned());
      params.push(Value::Integer(encode_ts(range.min())));
      params.push(Value::Integer(encode_ts(range.max())));
    }
    TimeFilter::At(instants) => {
      conds.push(format!("ts IN ({})", placeholders(instants.len())));
      params.extend(instants.iter().map(|ts| Value::Integer(encode_ts(*ts))));
    }
  }
  let clause = if conds.is_empty() {
    String::new()
  } else {
    format!("WHERE {}", conds.join(" AND "))
  };
  (clause, params)
}

// ─── DocumentStore impl ──────────────────────────────────────────────────────

impl DocumentStore for SqliteStore {
  type Error = crate::Error;

  // ── Coverage ledger ───────────────────────────────────────────────────────

  async fn load_coverage(&self, collection: &str, entity: &str) -> Result<Option<CoverageRecord>> {
    let (collection, entity) = (collection.to_owned(), entity.to_owned());
    let key = entity.clone();
    let raw: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT fields FROM coverage WHERE collection = ?1 AND entity = ?2",
              rusqlite::params![collection, key],
              |row| row.get(0),
            )
            .optional()?,
        )
      })
      .await?;

    match raw {
      Some(fields) => Ok(Some(CoverageRecord { entity, fields: decode_fields(&fields)? })),
      None => Ok(None),
    }
  }

  async fn save_coverage(
    &self,
    collection: &str,
    entity: &str,
    field: &str,
    coverage: &IntervalSet,
  ) -> Result<()> {
    let path = json_path(field)?;
    let value = encode_intervals(coverage)?;
    let (collection, entity, field) = (collection.to_owned(), entity.to_owned(), field.to_owned());

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO coverage (collection, entity, fields)
           VALUES (?1, ?2, json_object(?3, json(?4)))
           ON CONFLICT (collection, entity)
           DO UPDATE SET fields = json_set(fields, ?5, json(?4))",
          rusqlite::params![collection, entity, field, value, path],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn unset_coverage(
    &self,
    collection: &str,
    entity: &str,
    fields: &[String],
  ) -> Result<bool> {
    let paths = fields
      .iter()
      .map(|f| json_path(f))
      .collect::<Result<Vec<_>>>()?;
    let (collection, entity) = (collection.to_owned(), entity.to_owned());

    let existed = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let exists = tx
          .query_row(
            "SELECT 1 FROM coverage WHERE collection = ?1 AND entity = ?2",
            rusqlite::params![collection, entity],
            |_| Ok(true),
          )
          .optional()?
          .unwrap_or(false);
        if exists {
          for path in &paths {
            tx.execute(
              "UPDATE coverage SET fields = json_remove(fields, ?3)
               WHERE collection = ?1 AND entity = ?2",
              rusqlite::params![collection, entity, path],
            )?;
          }
        }
        tx.commit()?;
        Ok(exists)
      })
      .await?;
    Ok(existed)
  }

  async fn coverage_entities(&self, collection: &str) -> Result<Vec<String>> {
    let collection = collection.to_owned();
    let entities = self
      .conn
      .call(move |conn| {
        let mut stmt =
          conn.prepare("SELECT entity FROM coverage WHERE collection = ?1 ORDER BY entity")?;
        let rows = stmt
          .query_map(rusqlite::params![collection], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(entities)
  }

  // ── Field registry ────────────────────────────────────────────────────────

  async fn load_fields(&self, collection: &str) -> Result<Vec<String>> {
    let collection = collection.to_owned();
    let fields = self
      .conn
      .call(move |conn| {
        let mut stmt =
          conn.prepare("SELECT field FROM fields WHERE collection = ?1 ORDER BY field")?;
        let rows = stmt
          .query_map(rusqlite::params![collection], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(fields)
  }

  async fn insert_field(&self, collection: &str, field: &str) -> Result<()> {
    json_path(field)?;
    let (collection, field) = (collection.to_owned(), field.to_owned());
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT OR IGNORE INTO fields (collection, field) VALUES (?1, ?2)",
          rusqlite::params![collection, field],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn delete_field(&self, collection: &str, field: &str) -> Result<()> {
    let (collection, field) = (collection.to_owned(), field.to_owned());
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM fields WHERE collection = ?1 AND field = ?2",
          rusqlite::params![collection, field],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Audit log ─────────────────────────────────────────────────────────────

  async fn append_log(&self, collection: &str, entries: &[AuditLogEntry]) -> Result<()> {
    let collection = collection.to_owned();
    let encoded: Vec<_> = entries
      .iter()
      .map(|e| {
        (
          encode_uuid(e.entry_id),
          encode_dt(e.timestamp),
          e.operation.to_string(),
          e.entity.clone(),
          e.field.clone(),
          encode_ts(e.interval.min()),
          encode_ts(e.interval.max()),
        )
      })
      .collect();

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        {
          let mut stmt = tx.prepare(
            "INSERT INTO audit_log (
               entry_id, collection, recorded_at, operation,
               entity, field, interval_min, interval_max
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
          )?;
          for (id, at, op, entity, field, min, max) in &encoded {
            stmt.execute(rusqlite::params![id, collection, at, op, entity, field, min, max])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn read_log(&self, collection: &str, entity: Option<&str>) -> Result<Vec<AuditLogEntry>> {
    let collection = collection.to_owned();
    let entity = entity.map(str::to_owned);

    let raws: Vec<RawLogEntry> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT entry_id, recorded_at, operation, entity, field,
                  interval_min, interval_max
           FROM audit_log
           WHERE collection = ?1 AND (?2 IS NULL OR entity = ?2)
           ORDER BY recorded_at, rowid",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![collection, entity], |row| {
            Ok(RawLogEntry {
              entry_id:     row.get(0)?,
              recorded_at:  row.get(1)?,
              operation:    row.get(2)?,
              entity:       row.get(3)?,
              field:        row.get(4)?,
              interval_min: row.get(5)?,
              interval_max: row.get(6)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawLogEntry::into_entry).collect()
  }

  // ── Year partitions ───────────────────────────────────────────────────────

  async fn partitions(&self, collection: &str) -> Result<Vec<i32>> {
    check_collection(collection)?;
    let collection = collection.to_owned();
    let years = self
      .conn
      .call(move |conn| {
        let mut stmt =
          conn.prepare("SELECT year FROM partitions WHERE collection = ?1 ORDER BY year")?;
        let rows = stmt
          .query_map(rusqlite::params![collection], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<i32>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(years)
  }

  async fn upsert_rows(&self, collection: &str, year: i32, rows: Vec<Row>) -> Result<usize> {
    let table = partition_table(collection, year)?;
    let encoded = rows.iter().map(encode_row).collect::<Result<Vec<_>>>()?;
    let collection = collection.to_owned();

    let written = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute_batch(&partition_ddl(&table))?;
        tx.execute(
          "INSERT OR IGNORE INTO partitions (collection, year) VALUES (?1, ?2)",
          rusqlite::params![collection, year],
        )?;
        let mut written = 0;
        {
          let mut stmt = tx.prepare(&format!(
            "INSERT INTO \"{table}\" (entity, ts, data) VALUES (?1, ?2, ?3)
             ON CONFLICT (entity, ts) DO UPDATE SET data = json_patch(data, excluded.data)"
          ))?;
          for (entity, ts, data) in &encoded {
            written += stmt.execute(rusqlite::params![entity, ts, data])?;
          }
        }
        tx.commit()?;
        Ok(written)
      })
      .await?;
    Ok(written)
  }

  async fn find_rows(&self, collection: &str, year: i32, filter: &RowFilter) -> Result<Vec<Row>> {
    let Some(table) = self.existing_partition(collection, year).await? else {
      return Ok(Vec::new());
    };
    let (clause, params) = filter_clause(filter.entities.as_deref(), &filter.time);

    let raws: Vec<RawRow> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT entity, ts, data FROM \"{table}\" {clause} ORDER BY ts, entity"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), |row| {
            Ok(RawRow { entity: row.get(0)?, ts: row.get(1)?, data: row.get(2)? })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws
      .into_iter()
      .map(|raw| {
        raw.into_row().map(|row| match &filter.fields {
          Some(fields) => row.project(fields),
          None => row,
        })
      })
      .collect()
  }

  async fn unset_field(
    &self,
    collection: &str,
    year: i32,
    entity: &str,
    field: &str,
    range: TimeInterval,
  ) -> Result<usize> {
    let path = json_path(field)?;
    let Some(table) = self.existing_partition(collection, year).await? else {
      return Ok(0);
    };
    let entity = entity.to_owned();
    let (min, max) = (encode_ts(range.min()), encode_ts(range.max()));

    let touched = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          &format!(
            "UPDATE \"{table}\" SET data = json_remove(data, ?1)
             WHERE entity = ?2 AND ts >= ?3 AND ts < ?4
               AND json_type(data, ?1) IS NOT NULL"
          ),
          rusqlite::params![path, entity, min, max],
        )?)
      })
      .await?;
    Ok(touched)
  }

  async fn drop_field(&self, collection: &str, year: i32, field: &str) -> Result<usize> {
    let path = json_path(field)?;
    let Some(table) = self.existing_partition(collection, year).await? else {
      return Ok(0);
    };

    let touched = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          &format!(
            "UPDATE \"{table}\" SET data = json_remove(data, ?1)
             WHERE json_type(data, ?1) IS NOT NULL"
          ),
          rusqlite::params![path],
        )?)
      })
      .await?;
    Ok(touched)
  }

  async fn nearest(
    &self,
    collection: &str,
    year: i32,
    entities: &[String],
    at: Timestamp,
    direction: Direction,
  ) -> Result<Option<Timestamp>> {
    let Some(table) = self.existing_partition(collection, year).await? else {
      return Ok(None);
    };
    let (aggregate, cmp) = match direction {
      Direction::Earlier => ("MAX", "<="),
      Direction::Later => ("MIN", ">="),
    };
    let mut params: Vec<Value> = entities.iter().cloned().map(Value::Text).collect();
    params.push(Value::Integer(encode_ts(at)));
    let sql = format!(
      "SELECT {aggregate}(ts) FROM \"{table}\"
       WHERE entity IN ({}) AND ts {cmp} ?",
      placeholders(entities.len())
    );

    let found: Option<i64> = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(&sql, rusqlite::params_from_iter(params), |row| row.get(0))?)
      })
      .await?;
    found.map(decode_ts).transpose()
  }

  async fn bounds(&self, collection: &str, year: i32) -> Result<Option<(Timestamp, Timestamp)>> {
    let Some(table) = self.existing_partition(collection, year).await? else {
      return Ok(None);
    };
    let (first, last): (Option<i64>, Option<i64>) = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          &format!("SELECT MIN(ts), MAX(ts) FROM \"{table}\""),
          [],
          |row| Ok((row.get(0)?, row.get(1)?)),
        )?)
      })
      .await?;
    match first.zip(last) {
      Some((first, last)) => Ok(Some((decode_ts(first)?, decode_ts(last)?))),
      None => Ok(None),
    }
  }

  async fn distinct_entities(&self, collection: &str, year: i32) -> Result<Vec<String>> {
    let Some(table) = self.existing_partition(collection, year).await? else {
      return Ok(Vec::new());
    };
    let entities = self
      .conn
      .call(move |conn| {
        let mut stmt =
          conn.prepare(&format!("SELECT DISTINCT entity FROM \"{table}\" ORDER BY entity"))?;
        let rows = stmt
          .query_map([], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(rows)
      })
      .await?;
    Ok(entities)
  }

  async fn count_rows(&self, collection: &str, year: i32) -> Result<u64> {
    let Some(table) = self.existing_partition(collection, year).await? else {
      return Ok(0);
    };
    let count: i64 = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))?)
      })
      .await?;
    Ok(u64::try_from(count).unwrap_or(0))
  }
}
