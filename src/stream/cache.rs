//! Double-buffered merge buffer.
//!
//! Producers merge into the active half. A flush swaps the active pointer to
//! the other half in one atomic exchange, waits until every producer that
//! still holds the old half has finished, then drains it.
//!
//! Per half states:
//! - `Idle`: active or parked, no producer inside
//! - `Writing`: one or more producers merging
//! - `Draining`: a flush owns it

use crate::core::Result;
use crate::metrics::Metric;
use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Waits between two "still waiting" warnings of a drain.
const DRAIN_WARN_EVERY: u32 = 100;

/// State of one buffer half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfState {
    Idle,
    Writing,
    Draining,
}

/// Snapshot of a [`DataCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub active_keys: usize,
    pub inactive_keys: usize,
    pub switching: bool,
    pub active_state: HalfState,
    pub inactive_state: HalfState,
}

struct CacheHalf {
    data: DashMap<String, Metric, ahash::RandomState>,
    writers: AtomicUsize,
    draining: AtomicBool,
    idle: Mutex<()>,
    idle_signal: Condvar,
}

impl CacheHalf {
    fn new() -> Self {
        Self {
            data: DashMap::with_hasher(ahash::RandomState::new()),
            writers: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            idle: Mutex::new(()),
            idle_signal: Condvar::new(),
        }
    }

    fn finish_write(&self) {
        if self.writers.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Taking the lock orders this notify after the drainer's check.
            let _guard = self.idle.lock();
            self.idle_signal.notify_all();
        }
    }

    fn state(&self) -> HalfState {
        if self.draining.load(Ordering::SeqCst) {
            HalfState::Draining
        } else if self.writers.load(Ordering::SeqCst) > 0 {
            HalfState::Writing
        } else {
            HalfState::Idle
        }
    }
}

/// Holds a writer slot on one half for the duration of a merge.
struct WriteGuard {
    half: Arc<CacheHalf>,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        self.half.finish_write();
    }
}

/// Keyed merge buffer with an atomic double-buffer swap.
pub struct DataCache {
    halves: [Arc<CacheHalf>; 2],
    current: ArcSwap<CacheHalf>,
    switching: AtomicBool,
    drain_wait: Duration,
}

impl DataCache {
    /// `drain_wait` bounds a single wait for in-flight writers while draining.
    pub fn new(drain_wait: Duration) -> Self {
        let first = Arc::new(CacheHalf::new());
        let second = Arc::new(CacheHalf::new());
        Self {
            current: ArcSwap::new(Arc::clone(&first)),
            halves: [first, second],
            switching: AtomicBool::new(false),
            drain_wait,
        }
    }

    fn begin_write(&self) -> WriteGuard {
        loop {
            let half = self.current.load_full();
            half.writers.fetch_add(1, Ordering::SeqCst);
            // A swap may have happened between the load and the increment. The
            // drainer only trusts the count of the half it swapped out, so
            // back off and take the new one.
            if Arc::ptr_eq(&half, &self.current.load()) {
                return WriteGuard { half };
            }
            half.finish_write();
        }
    }

    /// Merge `metric` into the active half, inserting it when its id is new.
    pub fn accept(&self, metric: Metric) -> Result<()> {
        let guard = self.begin_write();
        // The entry borrows the half; release it before the guard drops.
        let merged = match guard.half.data.entry(metric.id().to_string()) {
            Entry::Occupied(mut existing) => existing.get_mut().merge(&metric),
            Entry::Vacant(slot) => {
                slot.insert(metric);
                Ok(())
            },
        };
        merged
    }

    /// Pending keys in the active half.
    pub fn current_size(&self) -> usize {
        self.current.load().data.len()
    }

    /// Swap halves and return the contents of the one swapped out.
    ///
    /// Returns `None` without blocking when another switch is in progress.
    pub fn switch_and_drain(&self) -> Option<Vec<Metric>> {
        if self
            .switching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }

        let old = self.current.load_full();
        let next = if Arc::ptr_eq(&old, &self.halves[0]) {
            Arc::clone(&self.halves[1])
        } else {
            Arc::clone(&self.halves[0])
        };
        self.current.store(next);

        old.draining.store(true, Ordering::SeqCst);
        self.wait_for_writers(&old);

        let keys: Vec<String> = old.data.iter().map(|entry| entry.key().clone()).collect();
        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, metric)) = old.data.remove(&key) {
                drained.push(metric);
            }
        }

        old.draining.store(false, Ordering::SeqCst);
        self.switching.store(false, Ordering::SeqCst);
        Some(drained)
    }

    fn wait_for_writers(&self, half: &CacheHalf) {
        let mut waits = 0u32;
        let mut idle = half.idle.lock();
        while half.writers.load(Ordering::SeqCst) > 0 {
            if half.idle_signal.wait_for(&mut idle, self.drain_wait).timed_out() {
                waits += 1;
                if waits % DRAIN_WARN_EVERY == 0 {
                    tracing::warn!(
                        writers = half.writers.load(Ordering::SeqCst),
                        waited_ms = u64::from(waits) * self.drain_wait.as_millis() as u64,
                        "Still waiting for writers before draining"
                    );
                }
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let active = self.current.load_full();
        let inactive = if Arc::ptr_eq(&active, &self.halves[0]) {
            &self.halves[1]
        } else {
            &self.halves[0]
        };
        CacheStats {
            active_keys: active.data.len(),
            inactive_keys: inactive.data.len(),
            switching: self.switching.load(Ordering::SeqCst),
            active_state: active.state(),
            inactive_state: inactive.state(),
        }
    }
}

impl Default for DataCache {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

impl std::fmt::Debug for DataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataCache").field("stats", &self.stats()).finish()
    }
}
