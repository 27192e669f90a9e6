//! Memory pressure relief.
//!
//! The factory remembers every RAM-tier object weakly, oldest first. A relief
//! pass migrates objects past the maximum RAM age, then the oldest remaining
//! ones until usage is back under the low watermark. Objects whose lock is
//! held are skipped, so a pass never waits on an object.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use tierstore_core::error::Result;
use tierstore_core::id::ObjectId;

const MIN_PRUNE_LEN: usize = 64;

/// A RAM-tier object that relief may push to disk.
pub(crate) trait Migratable: Send + Sync {
    /// Migrate if currently in RAM and not locked. `Ok(false)` if skipped.
    fn migrate_for_pressure(&self) -> Result<bool>;

    /// `Some(true)` while RAM-backed, `None` if the state lock is busy.
    fn is_ram_tier(&self) -> Option<bool>;
}

struct Tracked {
    id: ObjectId,
    created: Instant,
    object: Weak<dyn Migratable>,
}

pub(crate) struct RamRegistry {
    entries: Mutex<RegistryInner>,
}

struct RegistryInner {
    queue: VecDeque<Tracked>,
    prune_at: usize,
}

impl RamRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(RegistryInner {
                queue: VecDeque::new(),
                prune_at: MIN_PRUNE_LEN,
            }),
        }
    }

    /// Track a new RAM-tier object. Returns the age of the oldest tracked object.
    pub fn register(&self, id: ObjectId, created: Instant, object: Weak<dyn Migratable>) -> Duration {
        let mut inner = self.entries.lock();
        if inner.queue.len() >= inner.prune_at {
            inner.queue.retain(|t| t.object.strong_count() > 0);
            inner.prune_at = (inner.queue.len() * 2).max(MIN_PRUNE_LEN);
        }
        // Converted stores inherit their bucket's creation time; keep order.
        let pos = inner
            .queue
            .iter()
            .rposition(|t| t.created <= created)
            .map_or(0, |p| p + 1);
        inner.queue.insert(pos, Tracked { id, created, object });
        inner
            .queue
            .front()
            .map_or(Duration::ZERO, |t| t.created.elapsed())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().queue.len()
    }

    /// Run one relief pass. `used` reads the live RAM counter.
    pub fn relieve(&self, max_age: Duration, low_watermark: u64, used: impl Fn() -> u64) -> usize {
        let candidates: Vec<(ObjectId, Instant, Arc<dyn Migratable>)> = {
            let mut inner = self.entries.lock();
            inner.queue.retain(|t| t.object.strong_count() > 0);
            inner
                .queue
                .iter()
                .filter_map(|t| t.object.upgrade().map(|o| (t.id, t.created, o)))
                .collect()
        };

        let mut migrated = 0;
        for (id, created, object) in &candidates {
            let too_old = created.elapsed() >= max_age;
            // Oldest first: once one is young and usage is fine, so are the rest.
            if !too_old && used() <= low_watermark {
                break;
            }
            match object.migrate_for_pressure() {
                Ok(true) => {
                    migrated += 1;
                    debug!(object = %id, too_old, "migrated under memory pressure");
                }
                Ok(false) => {}
                Err(e) => warn!(object = %id, error = %e, "pressure migration failed"),
            }
        }

        self.entries
            .lock()
            .queue
            .retain(|t| match t.object.upgrade() {
                Some(o) => o.is_ram_tier() != Some(false),
                None => false,
            });
        migrated
    }
}
