//! Factory counters and the serializable stats snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryStats {
    pub ram_used: u64,
    pub peak_ram_used: u64,
    pub ram_capacity: u64,
    pub buckets_created: u64,
    pub stores_created: u64,
    pub ram_created: u64,
    pub disk_created: u64,
    pub migrations: u64,
    pub files_deleted: u64,
    pub open_handles: usize,
    /// RAM-tier objects known to the pressure registry (may include dead ones
    /// not yet pruned).
    pub tracked_ram_objects: usize,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub buckets_created: AtomicU64,
    pub stores_created: AtomicU64,
    pub ram_created: AtomicU64,
    pub disk_created: AtomicU64,
    pub migrations: AtomicU64,
    pub files_deleted: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
