//! Tracking allocator for model-engine buffers (§4.H "Allocator").
//!
//! Every tile/engine buffer is checked in and out under a handle, so
//! `force_cleanup` can report how much was actually reclaimed and
//! `wait_for_cleanup` can block, bounded, until outstanding allocations
//! drain. Installed on both the CPU and GPU model copies so memory can
//! be reclaimed between resource-type batches without reloading the
//! model.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use tracing::debug;

use std::time::Duration;

/// `wait_for_cleanup` never blocks past this, even if allocations remain
/// outstanding (§4.H).
pub const CLEANUP_WAIT_LIMIT: Duration = Duration::from_secs(5);

struct Bookkeeping {
    active: HashMap<u64, usize>,
}

/// Tracks outstanding engine allocations and reports/reclaims them.
pub struct TrackingAllocator {
    total_allocated: AtomicU64,
    allocation_count: AtomicUsize,
    next_id: AtomicU64,
    active: Mutex<Bookkeeping>,
    drained: Condvar,
}

impl TrackingAllocator {
    pub fn new() -> Self {
        TrackingAllocator {
            total_allocated: AtomicU64::new(0),
            allocation_count: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            active: Mutex::new(Bookkeeping { active: HashMap::new() }),
            drained: Condvar::new(),
        }
    }

    /// Record a new allocation of `size` bytes, returning a handle for
    /// [`Self::free`].
    pub fn track(&self, size: usize) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.active.lock().expect("allocator mutex poisoned").active.insert(id, size);
        self.total_allocated.fetch_add(size as u64, Ordering::SeqCst);
        self.allocation_count.fetch_add(1, Ordering::SeqCst);
        id
    }

    pub fn free(&self, id: u64) {
        let mut guard = self.active.lock().expect("allocator mutex poisoned");
        if let Some(size) = guard.active.remove(&id) {
            self.total_allocated.fetch_sub(size as u64, Ordering::SeqCst);
            self.allocation_count.fetch_sub(1, Ordering::SeqCst);
            if guard.active.is_empty() {
                self.drained.notify_all();
            }
        }
    }

    pub fn total_allocated(&self) -> u64 {
        self.total_allocated.load(Ordering::SeqCst)
    }

    pub fn allocation_count(&self) -> usize {
        self.allocation_count.load(Ordering::SeqCst)
    }

    /// Drop every outstanding allocation, returning the bytes freed.
    pub fn force_cleanup(&self) -> u64 {
        let mut guard = self.active.lock().expect("allocator mutex poisoned");
        let freed: usize = guard.active.values().sum();
        guard.active.clear();
        self.total_allocated.fetch_sub(freed as u64, Ordering::SeqCst);
        self.allocation_count.store(0, Ordering::SeqCst);
        self.drained.notify_all();
        debug!(freed, "allocator force cleanup");
        freed as u64
    }

    /// Block until no allocations remain outstanding, or
    /// [`CLEANUP_WAIT_LIMIT`] elapses, whichever comes first.
    pub fn wait_for_cleanup(&self) {
        let guard = self.active.lock().expect("allocator mutex poisoned");
        let (guard, timed_out) = self
            .drained
            .wait_timeout_while(guard, CLEANUP_WAIT_LIMIT, |b| !b.active.is_empty())
            .expect("allocator mutex poisoned");
        if timed_out.timed_out() && !guard.active.is_empty() {
            debug!(remaining = guard.active.len(), "wait_for_cleanup hit its 5s bound");
        }
    }
}

impl Default for TrackingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_and_free_round_trips_totals() {
        let allocator = TrackingAllocator::new();
        let id = allocator.track(1024);
        assert_eq!(allocator.total_allocated(), 1024);
        assert_eq!(allocator.allocation_count(), 1);
        allocator.free(id);
        assert_eq!(allocator.total_allocated(), 0);
        assert_eq!(allocator.allocation_count(), 0);
    }

    #[test]
    fn force_cleanup_reports_freed_bytes_and_zeroes_totals() {
        let allocator = TrackingAllocator::new();
        allocator.track(100);
        allocator.track(200);
        let freed = allocator.force_cleanup();
        assert_eq!(freed, 300);
        assert_eq!(allocator.total_allocated(), 0);
        assert_eq!(allocator.allocation_count(), 0);
    }

    #[test]
    fn wait_for_cleanup_returns_immediately_when_already_empty() {
        let allocator = TrackingAllocator::new();
        let started = std::time::Instant::now();
        allocator.wait_for_cleanup();
        assert!(started.elapsed() < CLEANUP_WAIT_LIMIT);
    }
}
