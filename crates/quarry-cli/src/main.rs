//! `quarry`: keep a local time-series cache up to date and read from it.
//!
//! Reads `quarry.toml` (or the path given with `--config`), opens the SQLite
//! store, and runs one subcommand against a configured collection. Output is
//! JSON lines on stdout; logs go to stderr.
//!
//! # Usage
//!
//! ```
//! quarry query -e 000001.SZ,600000.SH -f close --start 2020-01-01 --end 2020-02-01
//! quarry query -e 000001.SZ -f close --start 2020-01-01 --end 2021-01-01 --freq M --fill ffill
//! quarry remove -e 000001.SZ -f close --start 2020-01-10 --end 2020-01-20
//! quarry coverage -e 000001.SZ -f close
//! ```

mod config;
mod jsonl;

use std::{
  io::{self, Write as _},
  path::PathBuf,
  sync::Arc,
};

use anyhow::Context as _;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use quarry_core::{
  DynamicCollection, TimeInterval, Timestamp,
  calendar::{FillPolicy, Frequency},
  feeder::FeederRegistry,
  query::{Cancel, QueryParams},
};
use quarry_store_sqlite::SqliteStore;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

use crate::{config::QuarryConfig, jsonl::JsonlFeeder};

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "quarry", version, about = "Incremental cache for time-series sources")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "quarry.toml")]
  config: PathBuf,

  /// Collection to operate on; may be omitted when only one is configured.
  #[arg(long, env = "QUARRY_COLLECTION")]
  collection: Option<String>,

  #[command(subcommand)]
  command: Command,
}

/// Entities, fields and a `[start, end)` range.
#[derive(Args, Debug)]
struct Selection {
  #[arg(short, long, value_delimiter = ',', required = true)]
  entities: Vec<String>,

  #[arg(short, long, value_delimiter = ',', required = true)]
  fields: Vec<String>,

  /// Inclusive start, `YYYY-MM-DD` or RFC 3339.
  #[arg(long, value_parser = parse_timestamp)]
  start: Timestamp,

  /// Exclusive end, `YYYY-MM-DD` or RFC 3339.
  #[arg(long, value_parser = parse_timestamp)]
  end: Timestamp,
}

impl Selection {
  fn range(&self) -> quarry_core::Result<TimeInterval> { TimeInterval::new(self.start, self.end) }
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch missing data, then print rows.
  Query {
    #[command(flatten)]
    selection:   Selection,
    /// Read only grid dates: D, B, W or M.
    #[arg(long)]
    freq:        Option<Frequency>,
    /// Fill empty grid dates: none, ffill or bfill.
    #[arg(long, default_value = "none")]
    fill:        FillPolicy,
    /// Clear the range first and fetch it again.
    #[arg(long)]
    force:       bool,
    /// Bring coverage up to date and print the report instead of rows.
    #[arg(long)]
    update_only: bool,
  },
  /// Print the gaps a query would fetch.
  Plan {
    #[command(flatten)]
    selection: Selection,
  },
  /// Clear stored values and coverage in a range.
  Remove {
    #[command(flatten)]
    selection: Selection,
  },
  /// Print the covered intervals of one entity and field.
  Coverage {
    #[arg(short, long)]
    entity: String,
    #[arg(short, long)]
    field:  String,
  },
  /// List registered fields.
  Fields,
  /// Forget a field everywhere: registry, coverage and stored values.
  DropField { field: String },
  /// Print audit log entries.
  Log {
    #[arg(short, long)]
    entity: Option<String>,
  },
}

fn parse_timestamp(s: &str) -> Result<Timestamp, String> {
  if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
    return date
      .and_hms_opt(0, 0, 0)
      .map(|dt| dt.and_utc())
      .ok_or_else(|| format!("invalid date {s:?}"));
  }
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| format!("invalid timestamp {s:?}: {e}"))
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();
  let cfg = QuarryConfig::load(&cli.config)?;
  let collection_cfg = cfg.collection(cli.collection.as_deref())?.clone();

  let store = SqliteStore::open(&cfg.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", cfg.store_path))?;

  let mut feeders = FeederRegistry::new();
  feeders.register("jsonl", JsonlFeeder::new(&cfg.jsonl_dir));

  let collection = DynamicCollection::from_registry(
    Arc::new(store),
    collection_cfg,
    &feeders,
    cfg.fetch.clone(),
  )
  .await
  .context("failed to open collection")?;

  run(&collection, cli.command).await
}

async fn run(collection: &DynamicCollection<SqliteStore>, command: Command) -> anyhow::Result<()> {
  match command {
    Command::Query { selection, freq, fill, force, update_only } => {
      let mut params = QueryParams::new(
        selection.entities,
        selection.fields,
        selection.start,
        selection.end,
      )
      .fill(fill)
      .force_update(force)
      .update_only(update_only)
      .cancel(interrupt_signal());
      if let Some(freq) = freq {
        params = params.frequency(freq);
      }

      let response = collection.query(&params).await?;
      let update = &response.update;
      info!(
        pairs = update.pairs.len(),
        fetched = update.feeder_calls(),
        rows_written = update.rows_written(),
        complete = update.is_complete(),
        "coverage updated"
      );
      if !update.is_complete() {
        warn!("some pairs were not fully updated; run `quarry query --update-only` for details");
      }
      if update_only {
        print_lines(&update.pairs)
      } else {
        print_lines(&response.rows)
      }
    }
    Command::Plan { selection } => {
      let plans = collection
        .plan(&selection.entities, &selection.fields, selection.range()?)
        .await?;
      print_lines(plans.iter().filter(|plan| !plan.gaps.is_empty()))
    }
    Command::Remove { selection } => {
      let report = collection
        .remove_with(
          &selection.entities,
          &selection.fields,
          selection.range()?,
          Some(interrupt_signal()),
        )
        .await?;
      info!(rows_cleared = report.rows_cleared(), complete = report.is_complete(), "removed");
      print_lines(&report.pairs)
    }
    Command::Coverage { entity, field } => {
      let coverage = collection.coverage(&entity, &field).await?;
      print_lines(coverage.iter())
    }
    Command::Fields => print_lines(collection.fields().await),
    Command::DropField { field } => {
      let cleared = collection.drop_field(&field).await?;
      info!(field, rows_cleared = cleared, "dropped field");
      Ok(())
    }
    Command::Log { entity } => print_lines(collection.audit_log(entity.as_deref()).await?),
  }
}

/// A cancellation signal raised on Ctrl-C. Pairs already started finish.
fn interrupt_signal() -> Cancel {
  let (tx, rx) = watch::channel(false);
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupted; finishing pairs already started");
      let _ = tx.send(true);
    }
  });
  rx
}

fn print_lines<T: Serialize>(items: impl IntoIterator<Item = T>) -> anyhow::Result<()> {
  let mut out = io::stdout().lock();
  for item in items {
    serde_json::to_writer(&mut out, &item).context("failed to encode output")?;
    writeln!(out)?;
  }
  out.flush()?;
  Ok(())
}
