//! Persistence frontier tracking.
//!
//! Each subgroup keeps three atomics — latest delivered, minimum persisted,
//! minimum verified — updated from the predicate thread and read from any
//! application thread. A condvar pairs with the atomics so application code
//! can block until the shard-wide persistence frontier passes a version.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use squall_types::Version;

/// Per-subgroup frontier counters with a blocking wait.
pub struct SubgroupFrontier {
    delivered: AtomicI64,
    min_persisted: AtomicI64,
    min_verified: AtomicI64,
    // The mutex guards nothing but the condvar protocol; the atomics are the
    // source of truth for non-blocking readers.
    mtx: Mutex<()>,
    cv: Condvar,
}

impl SubgroupFrontier {
    pub fn new() -> Self {
        Self {
            delivered: AtomicI64::new(Version::NONE.as_i64()),
            min_persisted: AtomicI64::new(Version::NONE.as_i64()),
            min_verified: AtomicI64::new(Version::NONE.as_i64()),
            mtx: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn delivered(&self) -> Version {
        Version::new(self.delivered.load(Ordering::Acquire))
    }

    pub fn min_persisted(&self) -> Version {
        Version::new(self.min_persisted.load(Ordering::Acquire))
    }

    pub fn min_verified(&self) -> Version {
        Version::new(self.min_verified.load(Ordering::Acquire))
    }

    pub fn note_delivered(&self, version: Version) {
        self.delivered.fetch_max(version.as_i64(), Ordering::AcqRel);
    }

    /// Raises the shard-wide persisted minimum and wakes waiters.
    pub fn raise_persisted(&self, version: Version) {
        let prev = self.min_persisted.fetch_max(version.as_i64(), Ordering::AcqRel);
        if version.as_i64() > prev {
            let _guard = self.mtx.lock().unwrap();
            self.cv.notify_all();
        }
    }

    pub fn raise_verified(&self, version: Version) {
        let prev = self.min_verified.fetch_max(version.as_i64(), Ordering::AcqRel);
        if version.as_i64() > prev {
            let _guard = self.mtx.lock().unwrap();
            self.cv.notify_all();
        }
    }

    /// Blocks until the persisted minimum reaches `version`.
    ///
    /// Returns false without waiting if `version` is beyond the latest
    /// delivered version (the request can never be satisfied from here), and
    /// false on shutdown.
    pub fn wait_for_persisted(&self, version: Version, shutdown: &AtomicBool) -> bool {
        if version.as_i64() > self.delivered.load(Ordering::Acquire) {
            return false;
        }
        let mut guard = self.mtx.lock().unwrap();
        loop {
            if self.min_persisted.load(Ordering::Acquire) >= version.as_i64() {
                return true;
            }
            if shutdown.load(Ordering::Acquire) {
                return false;
            }
            let (g, _timeout) = self
                .cv
                .wait_timeout(guard, Duration::from_millis(10))
                .unwrap();
            guard = g;
        }
    }
}

impl Default for SubgroupFrontier {
    fn default() -> Self {
        Self::new()
    }
}
