//! Fixed-size random-access store, RAM or disk backed.
//!
//! A store is one logical resource behind an `Arc`: every handle (and the
//! bucket it may have been converted from) sees the same state, and freeing
//! through any of them frees it for all. The state lock is shared by `pread`
//! and exclusive for `pwrite`, migration and free, so a reader sees either the
//! RAM copy or the file, never a half-copied state.

use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use tracing::debug;

use tierstore_core::error::{Error, Result};
use tierstore_core::id::ObjectId;
use tierstore_io::FileBackedStore;
use tierstore_mem::RamBuffer;

use crate::factory::{FactoryShared, Placement, Tier};
use crate::pressure::Migratable;

enum StoreBacking {
    Ram(RamBuffer),
    Disk(FileBackedStore),
    Freed,
}

struct StoreState {
    backing: StoreBacking,
    migrated: bool,
}

struct StoreInner {
    id: ObjectId,
    size: u64,
    factory: Arc<FactoryShared>,
    state: RwLock<StoreState>,
}

#[derive(Clone)]
pub struct TempRandomAccessStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for TempRandomAccessStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempRandomAccessStore")
            .field("id", &self.inner.id)
            .field("size", &self.inner.size)
            .field("tier", &self.tier())
            .finish()
    }
}

impl TempRandomAccessStore {
    pub(crate) fn new(
        id: ObjectId,
        size: u64,
        factory: Arc<FactoryShared>,
        placement: Placement,
        created: Instant,
        migrated: bool,
    ) -> Self {
        let (backing, in_ram) = match placement {
            Placement::Ram(buf) => (StoreBacking::Ram(buf), true),
            Placement::Disk(file) => (StoreBacking::Disk(file), false),
        };
        let inner = Arc::new(StoreInner {
            id,
            size,
            factory: Arc::clone(&factory),
            state: RwLock::new(StoreState { backing, migrated }),
        });
        if in_ram {
            let weak: Weak<dyn Migratable> = Arc::downgrade(&inner) as Weak<dyn Migratable>;
            factory.track_ram_object(id, created, weak);
        }
        Self { inner }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// Fixed at creation.
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        let size = self.inner.size;
        match offset.checked_add(len as u64) {
            Some(end) if end <= size => Ok(()),
            _ => Err(Error::OutOfRange {
                offset,
                len: len as u64,
                size,
            }),
        }
    }

    /// Fill `buf` with the bytes at `offset`.
    pub fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let st = self.inner.state.read();
        if let StoreBacking::Freed = st.backing {
            return Err(Error::ObjectFreed);
        }
        self.check_range(offset, buf.len())?;
        match &st.backing {
            StoreBacking::Ram(ram) => {
                ram.read_at(offset, buf);
                Ok(())
            }
            StoreBacking::Disk(file) => file.pread(offset, buf),
            StoreBacking::Freed => Err(Error::ObjectFreed),
        }
    }

    /// Write `data` at `offset`.
    pub fn pwrite(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut st = self.inner.state.write();
        if let StoreBacking::Freed = st.backing {
            return Err(Error::ObjectFreed);
        }
        self.check_range(offset, data.len())?;
        match &mut st.backing {
            StoreBacking::Ram(ram) => ram.write_at(offset, data),
            StoreBacking::Disk(file) => file.pwrite(offset, data),
            StoreBacking::Freed => Err(Error::ObjectFreed),
        }
    }

    /// Read up to `out.len()` bytes at `pos`, stopping at the end. Used by
    /// bucket readers after conversion.
    pub(crate) fn read_some(&self, pos: u64, out: &mut [u8]) -> Result<usize> {
        let n = (self.inner.size.saturating_sub(pos)).min(out.len() as u64) as usize;
        self.pread(pos, &mut out[..n])?;
        Ok(n)
    }

    /// Move the bytes to a scratch file. Returns false if already on disk.
    pub fn migrate_to_disk(&self) -> Result<bool> {
        let mut st = self.inner.state.write();
        self.inner.migrate_locked(&mut st)
    }

    pub fn has_migrated(&self) -> bool {
        self.inner.state.read().migrated
    }

    /// Current tier, `None` once freed.
    pub fn tier(&self) -> Option<Tier> {
        match self.inner.state.read().backing {
            StoreBacking::Ram(_) => Some(Tier::Ram),
            StoreBacking::Disk(_) => Some(Tier::Disk),
            StoreBacking::Freed => None,
        }
    }

    pub fn is_ram(&self) -> bool {
        self.tier() == Some(Tier::Ram)
    }

    pub fn is_freed(&self) -> bool {
        matches!(self.inner.state.read().backing, StoreBacking::Freed)
    }

    /// Path of the backing file while on disk.
    pub fn backing_path(&self) -> Option<PathBuf> {
        match &self.inner.state.read().backing {
            StoreBacking::Disk(file) => Some(file.path().to_path_buf()),
            _ => None,
        }
    }

    /// True if both handles refer to the same underlying store.
    pub fn same_store(&self, other: &TempRandomAccessStore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Release the pooled file handle. Storage is kept; the next access reopens it.
    pub fn close(&self) {
        if let StoreBacking::Disk(file) = &self.inner.state.read().backing {
            file.close();
        }
    }

    /// Release the bytes: RAM accounting or the scratch file. Idempotent.
    /// The store is freed even if deleting the file fails.
    pub fn free(&self) -> Result<()> {
        let old = {
            let mut st = self.inner.state.write();
            mem::replace(&mut st.backing, StoreBacking::Freed)
        };
        match old {
            StoreBacking::Ram(ram) => {
                debug!(object = %self.inner.id, bytes = ram.accounted_bytes(), "freed RAM store");
                drop(ram);
                Ok(())
            }
            StoreBacking::Disk(file) => {
                debug!(object = %self.inner.id, "freeing disk store");
                self.inner.factory.dispose_file(file)
            }
            StoreBacking::Freed => Ok(()),
        }
    }
}

impl StoreInner {
    fn migrate_locked(&self, st: &mut StoreState) -> Result<bool> {
        let ram = match &st.backing {
            StoreBacking::Ram(ram) => ram,
            StoreBacking::Disk(_) => return Ok(false),
            StoreBacking::Freed => return Err(Error::ObjectFreed),
        };
        // Copy first; on failure the new file is dropped (and deleted) and the
        // store stays in RAM untouched.
        let file = self.factory.create_file()?;
        file.pwrite(0, ram)?;
        file.set_len(self.size)?;
        let old = mem::replace(&mut st.backing, StoreBacking::Disk(file));
        drop(old);
        st.migrated = true;
        self.factory.record_migration(self.id, self.size, "store");
        Ok(true)
    }
}

impl Migratable for StoreInner {
    fn migrate_for_pressure(&self) -> Result<bool> {
        match self.state.try_write() {
            Some(mut st) => self.migrate_locked(&mut st),
            None => Ok(false),
        }
    }

    fn is_ram_tier(&self) -> Option<bool> {
        self.state
            .try_read()
            .map(|st| matches!(st.backing, StoreBacking::Ram(_)))
    }
}
