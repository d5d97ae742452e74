//! Per-(entity, field) mutual exclusion.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex as StdMutex},
};

use tokio::sync::{Mutex, OwnedMutexGuard};

type Key = (String, String);

/// A lazily-populated map of async mutexes, one per (entity, field) pair.
///
/// Holding the guard serialises every read-modify-write of that pair's
/// coverage. Distinct pairs never contend.
#[derive(Debug, Default)]
pub struct KeyedLocks {
  locks: StdMutex<HashMap<Key, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
  pub fn new() -> Self { Self::default() }

  pub async fn lock(&self, entity: &str, field: &str) -> OwnedMutexGuard<()> {
    let lock = {
      let mut map = match self.locks.lock() {
        Ok(map) => map,
        Err(poisoned) => poisoned.into_inner(),
      };
      map
        .entry((entity.to_owned(), field.to_owned()))
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
    };
    lock.lock_owned().await
  }

  /// Drop entries nobody currently holds or waits on.
  pub fn prune(&self) {
    let mut map = match self.locks.lock() {
      Ok(map) => map,
      Err(poisoned) => poisoned.into_inner(),
    };
    map.retain(|_, lock| Arc::strong_count(lock) > 1);
  }

  pub fn len(&self) -> usize {
    match self.locks.lock() {
      Ok(map) => map.len(),
      Err(poisoned) => poisoned.into_inner().len(),
    }
  }

  pub fn is_empty(&self) -> bool { self.len() == 0 }

  /// Tasks holding or waiting on the pair's lock.
  #[cfg(test)]
  pub(crate) fn contenders(&self, entity: &str, field: &str) -> usize {
    let map = match self.locks.lock() {
      Ok(map) => map,
      Err(poisoned) => poisoned.into_inner(),
    };
    map
      .get(&(entity.to_owned(), field.to_owned()))
      .map_or(0, |lock| Arc::strong_count(lock) - 1)
  }
}
