//! Per-job locks
//!
//! Serializes restore and save of the same job across concurrent sessions.
//! The map only holds weak references: an entry lives as long as some session
//! holds or awaits the lock, and dead entries are pruned on every access.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

type LockMap = HashMap<String, Weak<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct JobLocks {
    inner: Arc<Mutex<LockMap>>,
}

/// Held lock for one job; released on drop
pub struct JobGuard {
    _guard: OwnedMutexGuard<()>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, LockMap> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, lock| lock.strong_count() > 0);
        map
    }

    /// Wait for exclusive access to `job`
    pub async fn lock(&self, job: &str) -> JobGuard {
        let mutex = {
            let mut map = self.entries();
            match map.get(job).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let created = Arc::new(AsyncMutex::new(()));
                    map.insert(job.to_string(), Arc::downgrade(&created));
                    created
                }
            }
        };

        debug!(job = job, "Waiting for job lock");
        let guard = mutex.lock_owned().await;
        debug!(job = job, "Acquired job lock");
        JobGuard { _guard: guard }
    }

    /// Whether a deleted job has no entry left. An entry that a session
    /// still holds or awaits is never removed, so this is false until the
    /// last of those sessions is done.
    pub fn forget(&self, job: &str) -> bool {
        !self.entries().contains_key(job)
    }

    /// Jobs whose lock is currently held or awaited
    pub fn active_jobs(&self) -> usize {
        self.entries().len()
    }
}
