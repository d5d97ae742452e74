//! Buffered, batch-flushed journal of coverage mutations.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::{
  Error, Result,
  interval::TimeInterval,
  ledger::{AuditLogEntry, Operation},
  store::DocumentStore,
};

/// Collects [`AuditLogEntry`]s in memory for the duration of one request and
/// writes them in a single batch on [`AuditLog::flush`].
///
/// The buffer is only cleared after the store acknowledges the batch, so a
/// failed flush can be retried without losing entries.
pub struct AuditLog<S> {
  store:      Arc<S>,
  collection: String,
  buffer:     Mutex<Vec<AuditLogEntry>>,
}

impl<S: DocumentStore> AuditLog<S> {
  pub fn new(store: Arc<S>, collection: impl Into<String>) -> Self {
    Self { store, collection: collection.into(), buffer: Mutex::new(Vec::new()) }
  }

  pub async fn insert(&self, entity: &str, field: &str, interval: TimeInterval) {
    self.push(Operation::Insert, entity, field, interval).await;
  }

  pub async fn remove(&self, entity: &str, field: &str, interval: TimeInterval) {
    self.push(Operation::Remove, entity, field, interval).await;
  }

  async fn push(&self, operation: Operation, entity: &str, field: &str, interval: TimeInterval) {
    self
      .buffer
      .lock()
      .await
      .push(AuditLogEntry::new(operation, entity, field, interval));
  }

  /// Entries buffered but not yet flushed.
  pub async fn pending(&self) -> usize { self.buffer.lock().await.len() }

  /// Write the buffer as one batch. Returns how many entries were written.
  pub async fn flush(&self) -> Result<usize> {
    let mut buffer = self.buffer.lock().await;
    if buffer.is_empty() {
      return Ok(0);
    }
    self
      .store
      .append_log(&self.collection, &buffer)
      .await
      .map_err(Error::coverage_write)?;
    let written = buffer.len();
    buffer.clear();
    debug!(collection = %self.collection, written, "flushed audit log");
    Ok(written)
  }
}
