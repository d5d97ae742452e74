//! [`DynamicCollection`]: the incremental fetch engine for one collection.
//!
//! `update` turns a requested range into per-pair gap lists, fetches each gap
//! from the bound feeder, writes the rows to the year partitions, and grows
//! the coverage ledger. The coverage rule for a fetched gap is:
//!
//! - rows returned: cover `[first row, last row + granularity)` only;
//! - nothing returned, not the last gap: cover the whole gap (confirmed
//!   absence, e.g. market holidays);
//! - nothing returned, last gap: cover nothing, so a later call retries the
//!   trailing edge once data exists.
//!
//! A feeder error never counts as "nothing returned".

use std::{
  collections::BTreeSet,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
};

use chrono::TimeDelta;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::{
  Error, Result,
  audit::AuditLog,
  config::{CollectionConfig, FetchPolicy},
  coverage::CoverageStore,
  feeder::{FeedError, FeedRequest, Feeder, FeederRegistry, FetchCache},
  interval::{IntervalSet, TimeInterval, Timestamp},
  ledger::AuditLogEntry,
  locks::KeyedLocks,
  partition::PartitionedStore,
  planner::{CoveragePlanner, FetchPlan},
  query::{Cancel, QueryParams, QueryResponse, is_cancelled, validate_names},
  report::{
    GapOutcome, GapReport, PairReport, PairStatus, RemoveReport, RemovedPair,
    UpdateReport,
  },
  row::Row,
  store::DocumentStore,
};

/// Per-call state shared by the pairs of one `update`.
struct CallScope<S> {
  audit:   AuditLog<S>,
  cache:   FetchCache,
  /// Set after a fatal error so pairs not yet started stand down.
  aborted: AtomicBool,
}

struct Shared<S> {
  config:      CollectionConfig,
  granularity: TimeDelta,
  policy:      FetchPolicy,
  store:       Arc<S>,
  coverage:    CoverageStore<S>,
  partitions:  PartitionedStore<S>,
  feeder:      Arc<dyn Feeder>,
  locks:       KeyedLocks,
}

/// A collection bound to one feeder. Cloning is cheap; clones share state,
/// including the per-pair locks.
pub struct DynamicCollection<S> {
  shared: Arc<Shared<S>>,
}

impl<S> Clone for DynamicCollection<S> {
  fn clone(&self) -> Self { Self { shared: self.shared.clone() } }
}

impl<S: DocumentStore> DynamicCollection<S> {
  pub async fn new(
    store: Arc<S>,
    config: CollectionConfig,
    feeder: Arc<dyn Feeder>,
    policy: FetchPolicy,
  ) -> Result<Self> {
    let granularity = config.granularity()?;
    let coverage = CoverageStore::open(store.clone(), config.name.clone()).await?;
    let partitions = PartitionedStore::new(store.clone(), config.name.clone());
    Ok(Self {
      shared: Arc::new(Shared {
        config,
        granularity,
        policy,
        store,
        coverage,
        partitions,
        feeder,
        locks: KeyedLocks::new(),
      }),
    })
  }

  /// Build with the feeder registered under `config.source`.
  pub async fn from_registry(
    store: Arc<S>,
    config: CollectionConfig,
    registry: &FeederRegistry,
    policy: FetchPolicy,
  ) -> Result<Self> {
    let feeder = registry.resolve(&config.source)?;
    Self::new(store, config, feeder, policy).await
  }

  pub fn name(&self) -> &str { &self.shared.config.name }

  pub fn config(&self) -> &CollectionConfig { &self.shared.config }

  pub fn partitions(&self) -> &PartitionedStore<S> { &self.shared.partitions }

  // ── Reads of ledger state ─────────────────────────────────────────────────

  pub async fn coverage(&self, entity: &str, field: &str) -> Result<IntervalSet> {
    self.shared.coverage.get(entity, field).await
  }

  pub async fn fields(&self) -> Vec<String> { self.shared.coverage.registry().fields().await }

  pub async fn audit_log(&self, entity: Option<&str>) -> Result<Vec<AuditLogEntry>> {
    self
      .shared
      .store
      .read_log(self.name(), entity)
      .await
      .map_err(Error::storage_read)
  }

  /// Gaps an `update` over `range` would fetch, without fetching.
  pub async fn plan(
    &self,
    entities: &[String],
    fields: &[String],
    range: TimeInterval,
  ) -> Result<Vec<FetchPlan>> {
    validate_names(entities, fields)?;
    CoveragePlanner::new(&self.shared.coverage)
      .plan_fetch(entities, fields, range)
      .await
  }

  // ── Query ─────────────────────────────────────────────────────────────────

  /// Ensure coverage for the request, then read the rows back.
  pub async fn query(&self, params: &QueryParams) -> Result<QueryResponse> {
    let range = params.validate()?;
    let cancel = params.cancel.clone();

    let removed = if params.force_update {
      Some(self.remove_with(&params.entities, &params.fields, range, cancel.clone()).await?)
    } else {
      None
    };
    let update = self
      .update_with(&params.entities, &params.fields, range, cancel)
      .await?;
    if params.update_only {
      return Ok(QueryResponse { rows: Vec::new(), update, removed });
    }

    let partitions = &self.shared.partitions;
    let entities = Some(params.entities.as_slice());
    let fields = Some(params.fields.as_slice());
    let mut rows = match params.frequency {
      None => partitions.query(entities, range, fields).await?,
      Some(frequency) => {
        partitions
          .query_frequency(entities, range, frequency, params.fill, fields)
          .await?
      }
    };
    rows.retain(|row| !row.values.is_empty());
    Ok(QueryResponse { rows, update, removed })
  }

  // ── Update ────────────────────────────────────────────────────────────────

  pub async fn update(
    &self,
    entities: &[String],
    fields: &[String],
    range: TimeInterval,
  ) -> Result<UpdateReport> {
    self.update_with(entities, fields, range, None).await
  }

  /// Fetch every gap of every (entity, field) pair in `range`.
  ///
  /// Pairs run concurrently up to `max_concurrent_pairs`. Feeder failures and
  /// row-write failures are reported per pair; a ledger write failure aborts
  /// the call once in-flight pairs finish.
  pub async fn update_with(
    &self,
    entities: &[String],
    fields: &[String],
    range: TimeInterval,
    cancel: Option<Cancel>,
  ) -> Result<UpdateReport> {
    validate_names(entities, fields)?;
    let scope = Arc::new(CallScope {
      audit:   AuditLog::new(self.shared.store.clone(), self.name()),
      cache:   FetchCache::new(),
      aborted: AtomicBool::new(false),
    });
    let permits = Arc::new(Semaphore::new(self.shared.policy.max_concurrent_pairs.max(1)));

    let mut tasks = Vec::new();
    for entity in entities {
      for field in fields {
        let key = (entity.clone(), field.clone());
        let this = self.clone();
        let scope = scope.clone();
        let permits = permits.clone();
        let cancel = cancel.clone();
        let (entity, field) = key.clone();
        let task = tokio::spawn(async move {
          let Ok(_permit) = permits.acquire_owned().await else {
            return Ok(PairReport::new(&entity, &field, PairStatus::Cancelled));
          };
          if scope.aborted.load(Ordering::SeqCst) || is_cancelled(cancel.as_ref()) {
            return Ok(PairReport::new(&entity, &field, PairStatus::Cancelled));
          }
          let result = this.update_pair(&entity, &field, range, &scope).await;
          if matches!(&result, Err(e) if e.is_fatal()) {
            scope.aborted.store(true, Ordering::SeqCst);
          }
          result
        });
        tasks.push((key, task));
      }
    }

    let mut report = UpdateReport::default();
    let mut fatal = None;
    for ((entity, field), task) in tasks {
      let pair = match task.await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) if e.is_fatal() => {
          error!(collection = %self.name(), %entity, %field, error = %e, "ledger write failed");
          fatal.get_or_insert(e);
          continue;
        }
        Ok(Err(e)) => {
          warn!(collection = %self.name(), %entity, %field, error = %e, "pair failed");
          PairReport::new(&entity, &field, PairStatus::Failed { reason: e.to_string() })
        }
        Err(join) => {
          error!(collection = %self.name(), %entity, %field, error = %join, "pair task died");
          PairReport::new(&entity, &field, PairStatus::Failed { reason: join.to_string() })
        }
      };
      report.pairs.push(pair);
    }

    let flushed = scope.audit.flush().await;
    self.shared.locks.prune();
    if let Some(e) = fatal {
      return Err(e);
    }
    flushed?;

    info!(
      collection = %self.name(),
      pairs = report.pairs.len(),
      feeder_calls = report.feeder_calls(),
      rows = report.rows_written(),
      skipped = report.skipped().count(),
      "update finished"
    );
    Ok(report)
  }

  /// Plan, fetch, and record one pair while holding its lock.
  async fn update_pair(
    &self,
    entity: &str,
    field: &str,
    range: TimeInterval,
    scope: &CallScope<S>,
  ) -> Result<PairReport> {
    let _guard = self.shared.locks.lock(entity, field).await;
    let planner = CoveragePlanner::new(&self.shared.coverage);
    let (mut coverage, gaps) = planner.gaps(entity, field, range).await?;
    if gaps.is_empty() {
      return Ok(PairReport::new(entity, field, PairStatus::UpToDate));
    }

    let mut report = PairReport::new(entity, field, PairStatus::Completed);
    let last_gap = gaps.len() - 1;
    let mut write_failure = None;

    for (i, gap) in gaps.into_iter().enumerate() {
      if write_failure.is_some() {
        let outcome = GapOutcome::Failed { reason: SKIPPED_AFTER_WRITE_FAILURE.to_owned() };
        debug!(collection = %self.name(), entity, field, %gap, "gap skipped");
        scope.audit.insert(entity, field, gap).await;
        report.gaps.push(GapReport { interval: gap, attempts: 0, outcome });
        continue;
      }
      let request = FeedRequest::new(&self.shared.config.source, entity, field, gap);
      let (fetched, attempts) = self.fetch(&request, &scope.cache).await;

      let outcome = match fetched {
        Err(reason) => GapOutcome::Failed { reason },
        Ok(rows) => match extent(&rows) {
          None if i < last_gap => {
            coverage.merge(gap);
            GapOutcome::ConfirmedEmpty
          }
          None => GapOutcome::LeftOpen,
          Some((first, last)) => match self.store_rows(rows, first, last).await {
            Ok((written, observed)) => {
              coverage.merge(observed);
              GapOutcome::Fetched { rows: written }
            }
            Err(e) => {
              let reason = e.to_string();
              write_failure = Some(reason.clone());
              GapOutcome::Failed { reason }
            }
          },
        },
      };

      debug!(collection = %self.name(), entity, field, %gap, ?outcome, "gap processed");
      scope.audit.insert(entity, field, gap).await;
      report.gaps.push(GapReport { interval: gap, attempts, outcome });
    }

    self.shared.coverage.set(entity, field, &coverage).await?;

    report.status = if let Some(reason) = write_failure {
      PairStatus::Failed { reason }
    } else if report
      .gaps
      .iter()
      .any(|g| matches!(g.outcome, GapOutcome::Failed { .. }))
    {
      PairStatus::Partial
    } else {
      PairStatus::Completed
    };
    Ok(report)
  }

  /// Write fetched rows stamped `first..=last`. Returns how many were
  /// written and the extent they cover.
  async fn store_rows(
    &self,
    rows: Vec<Row>,
    first: Timestamp,
    last: Timestamp,
  ) -> Result<(usize, TimeInterval)> {
    let observed = TimeInterval::observed(first, last, self.shared.granularity)?;
    let written = self.shared.partitions.insert(rows).await?;
    Ok((written, observed))
  }

  /// Call the feeder with a per-attempt timeout, retrying transient failures
  /// with linear backoff. Returns the outcome and the attempts spent.
  async fn fetch(
    &self,
    request: &FeedRequest,
    cache: &FetchCache,
  ) -> (std::result::Result<Vec<Row>, String>, u32) {
    let policy = &self.shared.policy;
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
      attempt += 1;
      let reason = match tokio::time::timeout(
        policy.timeout(),
        self.shared.feeder.fetch(request, cache),
      )
      .await
      {
        Ok(Ok(rows)) => return (Ok(rows), attempt),
        Ok(Err(FeedError::Permanent(reason))) => {
          warn!(entity = %request.entity, field = %request.field, %reason, "permanent feed error");
          return (Err(reason), attempt);
        }
        Ok(Err(FeedError::Transient(reason))) => reason,
        Err(_) => format!("timed out after {}ms", policy.timeout_ms),
      };

      if attempt >= max_attempts {
        let e = Error::TransientFetch { attempts: attempt, reason };
        warn!(entity = %request.entity, field = %request.field, error = %e, "gap left open");
        return (Err(e.to_string()), attempt);
      }
      warn!(
        entity = %request.entity,
        field = %request.field,
        attempt,
        %reason,
        "retrying fetch"
      );
      tokio::time::sleep(policy.backoff(attempt)).await;
    }
  }

  // ── Remove ────────────────────────────────────────────────────────────────

  pub async fn remove(
    &self,
    entities: &[String],
    fields: &[String],
    range: TimeInterval,
  ) -> Result<RemoveReport> {
    self.remove_with(entities, fields, range, None).await
  }

  /// Clear stored values and coverage for every pair inside `range`.
  ///
  /// Rows keep their other fields. A row-write failure stops that pair after
  /// recording what was already cleared. On cancellation the pairs not yet
  /// started are reported as cancelled and left untouched.
  pub async fn remove_with(
    &self,
    entities: &[String],
    fields: &[String],
    range: TimeInterval,
    cancel: Option<Cancel>,
  ) -> Result<RemoveReport> {
    validate_names(entities, fields)?;
    let audit = AuditLog::new(self.shared.store.clone(), self.name());
    let mut report = RemoveReport::default();

    for entity in entities {
      for field in fields {
        if is_cancelled(cancel.as_ref()) {
          report.pairs.push(RemovedPair::cancelled(entity, field));
          continue;
        }
        match self.remove_pair(entity, field, range, &audit).await {
          Ok(Some(pair)) => report.pairs.push(pair),
          Ok(None) => {}
          Err(e) => {
            if let Err(flush) = audit.flush().await {
              error!(collection = %self.name(), error = %flush, "audit flush failed");
            }
            self.shared.locks.prune();
            return Err(e);
          }
        }
      }
    }

    let flushed = audit.flush().await;
    self.shared.locks.prune();
    flushed?;
    info!(
      collection = %self.name(),
      pairs = report.pairs.len(),
      rows = report.rows_cleared(),
      complete = report.is_complete(),
      "remove finished"
    );
    Ok(report)
  }

  async fn remove_pair(
    &self,
    entity: &str,
    field: &str,
    range: TimeInterval,
    audit: &AuditLog<S>,
  ) -> Result<Option<RemovedPair>> {
    let _guard = self.shared.locks.lock(entity, field).await;
    let planner = CoveragePlanner::new(&self.shared.coverage);
    let (mut coverage, covered) = planner.covered(entity, field, range).await?;
    if covered.is_empty() {
      return Ok(None);
    }

    let mut pair = RemovedPair::new(entity, field);
    for sub in &covered {
      match self.shared.partitions.unset_field(entity, field, *sub).await {
        Ok(rows) => pair.rows_cleared += rows,
        Err(e) => {
          warn!(collection = %self.name(), entity, field, error = %e, "remove stopped");
          pair.error = Some(e.to_string());
          break;
        }
      }
      coverage.carve(*sub);
      audit.remove(entity, field, *sub).await;
      pair.cleared.push(*sub);
    }

    self.shared.coverage.set(entity, field, &coverage).await?;
    Ok(Some(pair))
  }

  // ── Fields ────────────────────────────────────────────────────────────────

  /// Forget `field` entirely: registry, every coverage record, stored values.
  ///
  /// Holds the lock of every known `(entity, field)` pair while it runs, so an
  /// update or remove of the same pair finishes first or starts after.
  pub async fn drop_field(&self, field: &str) -> Result<usize> {
    let mut entities: BTreeSet<String> =
      self.shared.coverage.entities().await?.into_iter().collect();
    entities.extend(self.shared.partitions.distinct_entities().await?);

    let mut guards = Vec::with_capacity(entities.len());
    for entity in &entities {
      guards.push(self.shared.locks.lock(entity, field).await);
    }
    let dropped = async {
      self.shared.coverage.drop_field(field).await?;
      self.shared.partitions.drop_field(field).await
    }
    .await;
    drop(guards);
    self.shared.locks.prune();

    let cleared = dropped?;
    info!(collection = %self.name(), field, rows = cleared, "dropped field");
    Ok(cleared)
  }
}

/// Outcome reason for gaps after a failed row write in the same pair.
const SKIPPED_AFTER_WRITE_FAILURE: &str = "skipped after write failure";

/// Earliest and latest timestamps in `rows`.
fn extent(rows: &[Row]) -> Option<(Timestamp, Timestamp)> {
  let first = rows.iter().map(|r| r.timestamp).min()?;
  let last = rows.iter().map(|r| r.timestamp).max()?;
  Some((first, last))
}
