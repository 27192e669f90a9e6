//! RamQuota + RAII reservation implementations.
//!
//! Every RAM-tier object holds a reservation for the bytes attributed to it.
//! Dropping the reservation returns the bytes to the quota (panic-safe), so the
//! counter reaches zero exactly when no RAM-tier object is alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tierstore_core::budget::{RamQuota, Reservation};

use crate::tracking::PeakTracker;

/// Shared inner state for the quota.
struct QuotaInner {
    capacity: u64,
    used: AtomicU64,
    peak: PeakTracker,
}

impl QuotaInner {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: AtomicU64::new(0),
            peak: PeakTracker::new(),
        }
    }

    fn try_acquire(&self, bytes: u64) -> bool {
        loop {
            let cur = self.used.load(Ordering::Relaxed);
            let next = cur.saturating_add(bytes);
            if next > self.capacity {
                return false;
            }
            if self
                .used
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.peak.record_used(next);
                return true;
            }
        }
    }

    fn release(&self, bytes: u64) {
        let prev = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "RAM quota underflow: {prev} < {bytes}");
    }
}

/// Point-in-time view of the quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub capacity: u64,
    pub used: u64,
    pub peak: u64,
}

/// Concrete RamQuota implementation used by the factory.
#[derive(Clone)]
pub struct RamQuotaImpl {
    inner: Arc<QuotaInner>,
}

impl RamQuotaImpl {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            inner: Arc::new(QuotaInner::new(capacity_bytes)),
        }
    }

    /// Highest usage observed since creation.
    pub fn peak_bytes(&self) -> u64 {
        self.inner.peak.peak()
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            capacity: self.inner.capacity,
            used: self.inner.used.load(Ordering::Acquire),
            peak: self.inner.peak.peak(),
        }
    }
}

/// RAII reservation that accounts for a number of bytes.
/// Dropping it returns bytes to the quota.
pub struct RamReservation {
    inner: Arc<QuotaInner>,
    bytes: u64,
    tag: &'static str,
}

impl std::fmt::Debug for RamReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamReservation")
            .field("bytes", &self.bytes)
            .field("tag", &self.tag)
            .finish()
    }
}

impl Drop for RamReservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.inner.release(self.bytes);
            // NOTE: do not log here to keep drop path fast.
            self.bytes = 0;
        }
    }
}

// ----- trait impls -----

impl Reservation for RamReservation {
    fn bytes(&self) -> u64 {
        self.bytes
    }
    fn tag(&self) -> &'static str {
        self.tag
    }
}

impl RamReservation {
    /// Try to resize this reservation to a new byte count.
    /// Returns true if successful, false if the new size would exceed capacity.
    /// Shrinking always succeeds.
    pub fn try_resize(&mut self, new_bytes: u64) -> bool {
        if new_bytes == self.bytes {
            return true;
        }

        if new_bytes < self.bytes {
            let delta = self.bytes - new_bytes;
            self.inner.release(delta);
            self.bytes = new_bytes;
            true
        } else {
            let delta = new_bytes - self.bytes;
            if self.inner.try_acquire(delta) {
                self.bytes = new_bytes;
                true
            } else {
                false
            }
        }
    }
}

impl RamQuota for RamQuotaImpl {
    type Reservation = RamReservation;

    fn try_reserve(&self, bytes: u64, tag: &'static str) -> Option<Self::Reservation> {
        if bytes == 0 {
            return Some(RamReservation {
                inner: Arc::clone(&self.inner),
                bytes: 0,
                tag,
            });
        }
        if self.inner.try_acquire(bytes) {
            Some(RamReservation {
                inner: Arc::clone(&self.inner),
                bytes,
                tag,
            })
        } else {
            None
        }
    }

    fn capacity_bytes(&self) -> u64 {
        self.inner.capacity
    }

    fn used_bytes(&self) -> u64 {
        self.inner.used.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_byte_reservation_is_free() {
        let quota = RamQuotaImpl::new(16);
        let r = quota.try_reserve(0, "zero").unwrap();
        assert_eq!(r.bytes(), 0);
        assert_eq!(quota.used_bytes(), 0);
    }

    #[test]
    fn resize_grows_and_shrinks() {
        let quota = RamQuotaImpl::new(100);
        let mut r = quota.try_reserve(10, "t").unwrap();
        assert!(r.try_resize(60));
        assert_eq!(quota.used_bytes(), 60);
        assert!(!r.try_resize(101));
        assert_eq!(r.bytes(), 60);
        assert!(r.try_resize(5));
        assert_eq!(quota.used_bytes(), 5);
        drop(r);
        assert_eq!(quota.used_bytes(), 0);
        assert_eq!(quota.peak_bytes(), 60);
    }

    #[test]
    fn exact_capacity_fits() {
        let quota = RamQuotaImpl::new(64);
        let r = quota.try_reserve(64, "t").unwrap();
        assert!(quota.try_reserve(1, "t").is_none());
        drop(r);
        assert!(quota.try_reserve(1, "t").is_some());
    }
}
