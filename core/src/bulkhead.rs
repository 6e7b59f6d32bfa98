//! Fail-fast admission counter for isolation pools
//!
//! A bulkhead caps how many executions a pool holds at once (running plus
//! queued). It never waits: when full, admission fails immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Lock-free admission counter
#[derive(Debug)]
pub struct Bulkhead {
    capacity: usize,
    admitted: AtomicUsize,
}

impl Bulkhead {
    /// Create a bulkhead admitting at most `capacity` executions
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Bulkhead capacity must be greater than 0");
        Self {
            capacity,
            admitted: AtomicUsize::new(0),
        }
    }

    /// Try to admit one execution without blocking
    pub fn try_admit(self: &Arc<Self>) -> Option<BulkheadPermit> {
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.capacity).then_some(current + 1)
            })
            .ok()
            .map(|_| BulkheadPermit {
                bulkhead: Arc::clone(self),
            })
    }

    /// Executions currently admitted
    pub fn admitted(&self) -> usize {
        self.admitted.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remaining admission slots
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.admitted())
    }
}

/// Admission slot, released on drop
#[derive(Debug)]
pub struct BulkheadPermit {
    bulkhead: Arc<Bulkhead>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.bulkhead.admitted.fetch_sub(1, Ordering::Release);
    }
}
