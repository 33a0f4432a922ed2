//! Engine-wide memory accounting
//!
//! Every heap value the engine creates charges its byte footprint against a
//! shared [`MemoryTracker`] and releases the same amount when it is dropped.
//! The tracker refuses any charge that would push usage past the configured
//! limit, which is how a guest script hits `MemoryLimitExceeded` instead of
//! exhausting the host.
//!
//! # Design
//!
//! The VM itself is single-threaded, but the counters are atomics so a host
//! can read the gauge from another thread for diagnostics without any
//! coordination:
//!
//! - **Charges**: CAS loop, so a refused charge never perturbs the counter
//! - **Releases**: single `fetch_sub`, always paired with a prior charge
//! - **Reads**: relaxed loads, safe from any thread

use crate::error::ExecError;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared byte gauge with a hard limit.
#[derive(Debug)]
pub struct MemoryTracker {
    limit: usize,
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryTracker {
    /// Create a tracker that refuses charges past `limit` bytes.
    pub fn new(limit: usize) -> Self {
        MemoryTracker {
            limit,
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Create a tracker that never refuses a charge.
    pub fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    /// Reserve `bytes` against the limit.
    ///
    /// Fails with [`ExecError::MemoryLimitExceeded`] without changing the
    /// counter when the reservation would exceed the limit.
    pub fn try_charge(&self, bytes: usize) -> Result<(), ExecError> {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(bytes) {
                Some(next) if next <= self.limit => next,
                _ => {
                    return Err(ExecError::MemoryLimitExceeded {
                        requested: bytes,
                        used: current,
                        limit: self.limit,
                    });
                }
            };
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::Relaxed);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `bytes` to the budget.
    ///
    /// Must be paired with a prior successful [`Self::try_charge`] of the
    /// same amount; the counter never goes below zero under that pairing.
    pub fn release(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "memory release without matching charge");
    }

    /// Bytes currently reserved.
    pub fn bytes_in_use(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// High-water mark of reserved bytes.
    pub fn peak_bytes(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// The configured limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// RAII record of bytes charged to a tracker.
///
/// Heap values own one of these; when the value drops, the charge is
/// returned. A charge can grow (container growth) and shrink; the running
/// total is what gets released on drop.
#[derive(Debug)]
pub struct MemoryCharge {
    tracker: Option<Arc<MemoryTracker>>,
    bytes: AtomicUsize,
}

impl MemoryCharge {
    /// A charge that accounts against nothing (host-created values).
    pub fn untracked() -> Self {
        MemoryCharge {
            tracker: None,
            bytes: AtomicUsize::new(0),
        }
    }

    /// Charge `bytes` up front against `tracker`.
    pub fn charge(tracker: &Arc<MemoryTracker>, bytes: usize) -> Result<Self, ExecError> {
        tracker.try_charge(bytes)?;
        Ok(MemoryCharge {
            tracker: Some(Arc::clone(tracker)),
            bytes: AtomicUsize::new(bytes),
        })
    }

    /// Charge `more` additional bytes (container growth).
    pub fn grow(&self, more: usize) -> Result<(), ExecError> {
        if let Some(tracker) = &self.tracker {
            tracker.try_charge(more)?;
            self.bytes.fetch_add(more, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Return `less` bytes early (entry removal).
    pub fn shrink(&self, less: usize) {
        if let Some(tracker) = &self.tracker {
            let prev = self.bytes.fetch_sub(less, Ordering::Relaxed);
            debug_assert!(prev >= less, "charge shrink below zero");
            tracker.release(less);
        }
    }
}

impl Drop for MemoryCharge {
    fn drop(&mut self) {
        if let Some(tracker) = &self.tracker {
            tracker.release(self.bytes.load(Ordering::Relaxed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_and_release_balance() {
        let tracker = MemoryTracker::new(1024);
        tracker.try_charge(100).unwrap();
        tracker.try_charge(200).unwrap();
        assert_eq!(tracker.bytes_in_use(), 300);
        tracker.release(100);
        tracker.release(200);
        assert_eq!(tracker.bytes_in_use(), 0);
        assert_eq!(tracker.peak_bytes(), 300);
    }

    #[test]
    fn test_refused_charge_leaves_counter_alone() {
        let tracker = MemoryTracker::new(256);
        tracker.try_charge(200).unwrap();
        let err = tracker.try_charge(100).unwrap_err();
        match err {
            ExecError::MemoryLimitExceeded {
                requested,
                used,
                limit,
            } => {
                assert_eq!(requested, 100);
                assert_eq!(used, 200);
                assert_eq!(limit, 256);
            }
            other => panic!("expected MemoryLimitExceeded, got {other:?}"),
        }
        assert_eq!(tracker.bytes_in_use(), 200);
    }

    #[test]
    fn test_charge_guard_releases_on_drop() {
        let tracker = Arc::new(MemoryTracker::new(1024));
        {
            let charge = MemoryCharge::charge(&tracker, 64).unwrap();
            charge.grow(32).unwrap();
            assert_eq!(tracker.bytes_in_use(), 96);
            charge.shrink(16);
            assert_eq!(tracker.bytes_in_use(), 80);
        }
        assert_eq!(tracker.bytes_in_use(), 0);
    }

    #[test]
    fn test_unlimited_never_refuses() {
        let tracker = MemoryTracker::unlimited();
        tracker.try_charge(usize::MAX / 2).unwrap();
    }
}
