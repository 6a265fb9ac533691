//! Per-ride mutual exclusion.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Entries nobody holds are dropped once the map grows past this.
const PRUNE_AT: usize = 1024;

/// One async mutex per ride id, created on first use.
#[derive(Default)]
pub(crate) struct RideLocks {
  inner: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl RideLocks {
  /// Wait for exclusive access to `ride_id`. Other rides are unaffected.
  pub(crate) async fn acquire(&self, ride_id: Uuid) -> OwnedMutexGuard<()> {
    let lock = {
      let mut map = self.inner.lock();
      if map.len() >= PRUNE_AT {
        // Only the map itself holds an unused entry.
        map.retain(|_, l| Arc::strong_count(l) > 1);
      }
      map.entry(ride_id).or_default().clone()
    };
    lock.lock_owned().await
  }

  #[cfg(test)]
  pub(crate) fn len(&self) -> usize { self.inner.lock().len() }
}
