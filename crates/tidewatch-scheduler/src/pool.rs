//! Bounded worker pool: a fixed number of execution slots shared by every
//! job. A job is only claimed once a slot is in hand, so at most
//! `capacity` handlers run concurrently per scheduler process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed-capacity pool of execution slots.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    processed: Arc<AtomicU64>,
}

/// A held execution slot. Dropping it frees the slot; only
/// [`WorkerSlot::release`] counts a finished run.
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
    processed: Arc<AtomicU64>,
}

impl WorkerSlot {
    /// Free the slot after a run that actually executed.
    pub fn release(self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }
}

impl WorkerPool {
    /// A pool with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Take a free slot without waiting. `None` when the pool is saturated.
    pub fn try_acquire(&self) -> Option<WorkerSlot> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;
        Some(WorkerSlot {
            _permit: permit,
            processed: Arc::clone(&self.processed),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.permits.available_permits();
        PoolStats {
            capacity: self.capacity,
            active: self.capacity - available,
            available,
            total_processed: self.processed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pool utilisation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub active: usize,
    pub available: usize,
    pub total_processed: u64,
}
