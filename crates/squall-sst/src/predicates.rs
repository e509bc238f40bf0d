//! The predicate engine.
//!
//! Coordination logic registers (predicate, handler) pairs against the table.
//! A single predicate thread sweeps the registry in FIFO registration order;
//! when a predicate returns true its handler runs synchronously on that
//! thread. This serializes delivery, view-change, and persistence handlers
//! against each other without any further locking between subsystems.
//!
//! Because every tracked field is monotone, recurrent predicates latch: the
//! handler advances its own "next target" and needs no guard against
//! out-of-order firings.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::Sst;

/// How long a registered predicate lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateKind {
    /// Deregisters itself after its first firing.
    OneShot,
    /// Evaluated on every sweep until explicitly removed.
    Recurrent,
}

/// Token returned by registration, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PredicateHandle(u64);

type PredFn = Box<dyn FnMut(&Sst) -> bool + Send>;
type HandlerFn = Box<dyn FnMut(&Sst) + Send>;

struct Entry {
    id: u64,
    name: &'static str,
    kind: PredicateKind,
    pred: PredFn,
    handler: HandlerFn,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
    /// Handles removed while their entries were checked out by a sweep.
    tombstones: HashSet<u64>,
}

/// FIFO predicate registry. Handlers may register and remove predicates from
/// within a sweep; additions take effect on the next sweep.
pub struct Predicates {
    inner: Mutex<Registry>,
    next_id: AtomicU64,
}

impl Predicates {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(
        &self,
        name: &'static str,
        kind: PredicateKind,
        pred: impl FnMut(&Sst) -> bool + Send + 'static,
        handler: impl FnMut(&Sst) + Send + 'static,
    ) -> PredicateHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner.entries.push(Entry {
            id,
            name,
            kind,
            pred: Box::new(pred),
            handler: Box::new(handler),
        });
        PredicateHandle(id)
    }

    /// Deregisters a predicate. Safe to call from inside a handler; the
    /// entry is dropped at the end of the current sweep.
    pub fn remove(&self, handle: PredicateHandle) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.entries.iter().position(|e| e.id == handle.0) {
            inner.entries.remove(pos);
        } else {
            inner.tombstones.insert(handle.0);
        }
    }

    /// Drops every registered predicate. Called when a view's SST retires.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.tombstones.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one sweep: evaluates every predicate in registration order and
    /// fires the handlers whose guards hold. Returns the number fired.
    pub(crate) fn sweep(&self, sst: &Sst) -> usize {
        // Check the entries out of the registry so handlers can re-enter it.
        let mut checked_out = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.entries)
        };

        let mut fired = 0;
        let mut keep = Vec::with_capacity(checked_out.len());
        for mut entry in checked_out.drain(..) {
            let removed_mid_sweep = {
                let inner = self.inner.lock().unwrap();
                inner.tombstones.contains(&entry.id)
            };
            if removed_mid_sweep {
                continue;
            }
            let hit = (entry.pred)(sst);
            if hit {
                tracing::trace!(predicate = entry.name, "predicate fired");
                (entry.handler)(sst);
                fired += 1;
            }
            if !(hit && entry.kind == PredicateKind::OneShot) {
                keep.push(entry);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        // Re-apply tombstones for entries that were checked out, then splice
        // survivors ahead of anything registered during the sweep to preserve
        // FIFO order.
        keep.retain(|e| !inner.tombstones.contains(&e.id));
        inner.tombstones.clear();
        let registered_mid_sweep = std::mem::take(&mut inner.entries);
        inner.entries = keep;
        inner.entries.extend(registered_mid_sweep);
        fired
    }
}

impl Default for Predicates {
    fn default() -> Self {
        Self::new()
    }
}
