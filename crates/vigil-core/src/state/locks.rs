//! Process-wide registry of per-key locks.
//!
//! One mutex per normalized blob name, created on first use and kept for
//! the life of the process. The key space of a module is small, so the map
//! is allowed to grow without eviction.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

static KEY_LOCKS: LazyLock<DashMap<String, Arc<Mutex<()>>>> = LazyLock::new(DashMap::new);

/// How often a waiting caller re-checks its cancellation token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The lock guarding `name`.
pub(crate) fn lock_for(name: &str) -> Arc<Mutex<()>> {
    if let Some(lock) = KEY_LOCKS.get(name) {
        return Arc::clone(&lock);
    }
    KEY_LOCKS
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Acquire `lock`, giving up with `None` once `cancel` fires.
pub(crate) fn acquire<'a>(
    lock: &'a Mutex<()>,
    cancel: &CancellationToken,
) -> Option<MutexGuard<'a, ()>> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        if let Some(guard) = lock.try_lock_for(CANCEL_POLL_INTERVAL) {
            return Some(guard);
        }
    }
}

#[cfg(test)]
pub(crate) fn registered_locks() -> usize {
    KEY_LOCKS.len()
}
