//! SQL schema for the quarry SQLite store.
//!
//! Executed once at connection startup. Row partitions are created lazily by
//! [`partition_ddl`] on the first write to a (collection, year).

/// Ledger tables; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

-- One document per entity: {\"<field>\": [[start, end], ...], ...}
CREATE TABLE IF NOT EXISTS coverage (
    collection  TEXT NOT NULL,
    entity      TEXT NOT NULL,
    fields      TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (collection, entity)
);

CREATE TABLE IF NOT EXISTS fields (
    collection  TEXT NOT NULL,
    field       TEXT NOT NULL,
    PRIMARY KEY (collection, field)
);

-- Append-only. No UPDATE or DELETE is ever issued against this table.
CREATE TABLE IF NOT EXISTS audit_log (
    entry_id      TEXT PRIMARY KEY,
    collection    TEXT NOT NULL,
    recorded_at   TEXT NOT NULL,   -- RFC 3339 UTC, fixed width
    operation     TEXT NOT NULL,   -- 'insert' | 'remove'
    entity        TEXT NOT NULL,
    field         TEXT NOT NULL,
    interval_min  INTEGER NOT NULL,
    interval_max  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS partitions (
    collection  TEXT NOT NULL,
    year        INTEGER NOT NULL,
    PRIMARY KEY (collection, year)
);

CREATE INDEX IF NOT EXISTS audit_log_entity_idx ON audit_log(collection, entity);

PRAGMA user_version = 1;
";

/// DDL for one row partition. `table` must already be validated.
pub fn partition_ddl(table: &str) -> String {
  format!(
    "CREATE TABLE IF NOT EXISTS \"{table}\" (
         entity  TEXT NOT NULL,
         ts      INTEGER NOT NULL,   -- epoch microseconds, UTC
         data    TEXT NOT NULL,      -- JSON object of field values
         PRIMARY KEY (entity, ts)
     );
     CREATE INDEX IF NOT EXISTS \"{table}_ts_idx\" ON \"{table}\"(ts);"
  )
}
