//! Write-once temp bucket.
//!
//! A bucket is written sequentially through exactly one `BucketWriter`, then
//! read any number of times through `BucketReader`s. While in RAM its
//! reservation grows with the content; when growth would break the per-object
//! cap or the global quota, the bytes move to a scratch file mid-write and the
//! writer carries on there.
//!
//! Once writing is over the bucket can be turned into a random-access store
//! over the same bytes. The store takes the backing; the bucket keeps a handle
//! to it and forwards reads, migration and free.

use std::io::{self, Read, Write};
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
use crate::store::TempRandomAccessStore;

/// Progress of the single write pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePhase {
    /// Output stream never opened.
    Fresh,
    /// Output stream open.
    Writing,
    /// Output stream closed.
    Closed,
}

enum BucketBacking {
    Ram(RamBuffer),
    Disk(FileBackedStore),
    Converted(TempRandomAccessStore),
    Freed,
}

struct BucketState {
    backing: BucketBacking,
    len: u64,
    phase: WritePhase,
    readers: usize,
    migrated: bool,
}

struct BucketInner {
    id: ObjectId,
    created: Instant,
    factory: Arc<FactoryShared>,
    state: RwLock<BucketState>,
}

pub struct TempBucket {
    inner: Arc<BucketInner>,
}

impl std::fmt::Debug for TempBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempBucket")
            .field("id", &self.inner.id)
            .field("size", &self.size())
            .field("tier", &self.tier())
            .finish()
    }
}

impl TempBucket {
    pub(crate) fn new(id: ObjectId, factory: Arc<FactoryShared>, placement: Placement) -> Self {
        let (backing, in_ram) = match placement {
            Placement::Ram(buf) => (BucketBacking::Ram(buf), true),
            Placement::Disk(file) => (BucketBacking::Disk(file), false),
        };
        let created = Instant::now();
        let inner = Arc::new(BucketInner {
            id,
            created,
            factory: Arc::clone(&factory),
            state: RwLock::new(BucketState {
                backing,
                len: 0,
                phase: WritePhase::Fresh,
                readers: 0,
                migrated: false,
            }),
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

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.inner.state.read().len
    }

    pub fn write_phase(&self) -> WritePhase {
        self.inner.state.read().phase
    }

    /// Current tier, `None` once freed.
    pub fn tier(&self) -> Option<Tier> {
        match &self.inner.state.read().backing {
            BucketBacking::Ram(_) => Some(Tier::Ram),
            BucketBacking::Disk(_) => Some(Tier::Disk),
            BucketBacking::Converted(store) => store.tier(),
            BucketBacking::Freed => None,
        }
    }

    pub fn is_ram(&self) -> bool {
        self.tier() == Some(Tier::Ram)
    }

    pub fn has_migrated(&self) -> bool {
        let st = self.inner.state.read();
        match &st.backing {
            BucketBacking::Converted(store) => store.has_migrated(),
            _ => st.migrated,
        }
    }

    pub fn is_freed(&self) -> bool {
        match &self.inner.state.read().backing {
            BucketBacking::Freed => true,
            BucketBacking::Converted(store) => store.is_freed(),
            _ => false,
        }
    }

    /// Path of the backing file while on disk.
    pub fn backing_path(&self) -> Option<PathBuf> {
        match &self.inner.state.read().backing {
            BucketBacking::Disk(file) => Some(file.path().to_path_buf()),
            BucketBacking::Converted(store) => store.backing_path(),
            _ => None,
        }
    }

    /// Open the single output stream. Only possible once per bucket.
    pub fn open_for_write(&self) -> Result<BucketWriter> {
        let mut st = self.inner.state.write();
        match &st.backing {
            BucketBacking::Freed => return Err(Error::ObjectFreed),
            BucketBacking::Converted(_) => return Err(Error::ReadOnlyAfterConversion),
            _ => {}
        }
        match st.phase {
            WritePhase::Fresh => st.phase = WritePhase::Writing,
            WritePhase::Writing => return Err(Error::ObjectBusy("output stream already open")),
            WritePhase::Closed => return Err(Error::WriteAfterClose),
        }
        Ok(BucketWriter {
            bucket: Arc::clone(&self.inner),
            closed: false,
        })
    }

    /// Open an independent input stream positioned at the start.
    pub fn open_for_read(&self) -> Result<BucketReader> {
        let mut guard = self.inner.state.write();
        let st = &mut *guard;
        match &st.backing {
            BucketBacking::Freed => return Err(Error::ObjectFreed),
            BucketBacking::Converted(store) if store.is_freed() => return Err(Error::ObjectFreed),
            _ => {}
        }
        if st.phase != WritePhase::Closed {
            return Err(Error::ReadWhileOpenForWrite);
        }
        st.readers += 1;
        Ok(BucketReader {
            bucket: Arc::clone(&self.inner),
            pos: 0,
        })
    }

    /// Move the bytes to a scratch file. Returns false if already on disk,
    /// including when a converted store was migrated.
    pub fn migrate_to_disk(&self) -> Result<bool> {
        let mut st = self.inner.state.write();
        if st.phase == WritePhase::Writing && !matches!(st.backing, BucketBacking::Freed) {
            return Err(Error::ObjectBusy("output stream open"));
        }
        self.inner.migrate_locked(&mut st)
    }

    /// Random-access view over the written bytes, sharing the backing.
    ///
    /// Requires the output stream closed and no input stream open. Calling it
    /// again returns the same store. Afterwards the bucket can never be
    /// written to again.
    pub fn to_random_access_store(&self) -> Result<TempRandomAccessStore> {
        let mut guard = self.inner.state.write();
        let st = &mut *guard;
        match &st.backing {
            BucketBacking::Freed => return Err(Error::ObjectFreed),
            BucketBacking::Converted(store) if store.is_freed() => return Err(Error::ObjectFreed),
            BucketBacking::Converted(store) => return Ok(store.clone()),
            _ => {}
        }
        match st.phase {
            WritePhase::Fresh => return Err(Error::ObjectBusy("output stream never written")),
            WritePhase::Writing => return Err(Error::ObjectBusy("output stream open")),
            WritePhase::Closed => {}
        }
        if st.readers > 0 {
            return Err(Error::ObjectBusy("input stream open"));
        }

        let placement = match mem::replace(&mut st.backing, BucketBacking::Freed) {
            BucketBacking::Ram(buf) => Placement::Ram(buf),
            BucketBacking::Disk(file) => Placement::Disk(file),
            other => {
                st.backing = other;
                return Err(Error::ObjectFreed);
            }
        };
        let store = TempRandomAccessStore::new(
            self.inner.id,
            st.len,
            Arc::clone(&self.inner.factory),
            placement,
            self.inner.created,
            st.migrated,
        );
        debug!(object = %self.inner.id, size = st.len, "converted bucket to random-access store");
        st.backing = BucketBacking::Converted(store.clone());
        Ok(store)
    }

    /// Release the bytes, whether held here or by the converted store.
    /// Idempotent. The bucket is freed even if deleting the file fails.
    pub fn free(&self) -> Result<()> {
        let old = {
            let mut st = self.inner.state.write();
            mem::replace(&mut st.backing, BucketBacking::Freed)
        };
        match old {
            BucketBacking::Ram(buf) => {
                debug!(object = %self.inner.id, bytes = buf.accounted_bytes(), "freed RAM bucket");
                drop(buf);
                Ok(())
            }
            BucketBacking::Disk(file) => {
                debug!(object = %self.inner.id, "freeing disk bucket");
                self.inner.factory.dispose_file(file)
            }
            BucketBacking::Converted(store) => store.free(),
            BucketBacking::Freed => Ok(()),
        }
    }
}

impl BucketInner {
    fn migrate_locked(&self, st: &mut BucketState) -> Result<bool> {
        let buf = match &st.backing {
            BucketBacking::Ram(buf) => buf,
            BucketBacking::Disk(_) => return Ok(false),
            BucketBacking::Converted(store) => return store.migrate_to_disk(),
            BucketBacking::Freed => return Err(Error::ObjectFreed),
        };
        // Copy first; on failure the new file is dropped (and deleted) and the
        // bucket stays in RAM untouched.
        let file = self.factory.create_file()?;
        file.pwrite(0, buf)?;
        let old = mem::replace(&mut st.backing, BucketBacking::Disk(file));
        drop(old);
        st.migrated = true;
        self.factory.record_migration(self.id, st.len, "bucket");
        Ok(true)
    }

    /// Append for the writer. Spills to disk when RAM growth is refused.
    fn append(&self, data: &[u8]) -> Result<()> {
        let grew_ram = {
            let mut guard = self.state.write();
            let st = &mut *guard;
            if let BucketBacking::Freed = st.backing {
                return Err(Error::ObjectFreed);
            }
            if st.phase != WritePhase::Writing {
                return Err(Error::WriteAfterClose);
            }
            let offset = st.len;
            let cap = self.factory.config().max_ram_per_object;
            let spill = match &mut st.backing {
                BucketBacking::Ram(buf) => !buf.try_append(data, cap),
                BucketBacking::Disk(file) => {
                    file.pwrite(offset, data)?;
                    false
                }
                BucketBacking::Converted(_) => return Err(Error::ReadOnlyAfterConversion),
                BucketBacking::Freed => return Err(Error::ObjectFreed),
            };
            if spill {
                debug!(object = %self.id, size = offset + data.len() as u64, "bucket outgrew RAM; spilling");
                self.migrate_locked(st)?;
                if let BucketBacking::Disk(file) = &st.backing {
                    file.pwrite(offset, data)?;
                }
            }
            st.len += data.len() as u64;
            matches!(st.backing, BucketBacking::Ram(_))
        };
        if grew_ram {
            self.factory.note_ram_growth();
        }
        Ok(())
    }

    fn finish_write(&self) -> Result<()> {
        let mut st = self.state.write();
        if let BucketBacking::Freed = st.backing {
            return Err(Error::ObjectFreed);
        }
        st.phase = WritePhase::Closed;
        if let BucketBacking::Ram(buf) = &mut st.backing {
            buf.fit();
        }
        Ok(())
    }

    fn read_at(&self, pos: u64, out: &mut [u8]) -> Result<usize> {
        let st = self.state.read();
        let remaining = st.len.saturating_sub(pos);
        let n = remaining.min(out.len() as u64) as usize;
        match &st.backing {
            BucketBacking::Ram(buf) => Ok(buf.read_at(pos, &mut out[..n])),
            BucketBacking::Disk(file) => {
                file.pread(pos, &mut out[..n])?;
                Ok(n)
            }
            BucketBacking::Converted(store) => store.read_some(pos, &mut out[..n]),
            BucketBacking::Freed => Err(Error::ObjectFreed),
        }
    }

    fn release_reader(&self) {
        let mut st = self.state.write();
        st.readers = st.readers.saturating_sub(1);
    }
}

impl Migratable for BucketInner {
    fn migrate_for_pressure(&self) -> Result<bool> {
        match self.state.try_write() {
            // Converted buckets are tracked through their store.
            Some(mut st) if matches!(st.backing, BucketBacking::Ram(_)) => {
                self.migrate_locked(&mut st)
            }
            _ => Ok(false),
        }
    }

    fn is_ram_tier(&self) -> Option<bool> {
        self.state
            .try_read()
            .map(|st| matches!(st.backing, BucketBacking::Ram(_)))
    }
}

/// The bucket's single output stream. Closing it (explicitly or by dropping)
/// ends the write phase.
pub struct BucketWriter {
    bucket: Arc<BucketInner>,
    closed: bool,
}

impl BucketWriter {
    /// Close the stream. Later writes fail with `WriteAfterClose`.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.bucket.finish_write()
    }
}

impl Write for BucketWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(Error::WriteAfterClose.into());
        }
        self.bucket.append(data)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for BucketWriter {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

/// An independent input stream. Follows the bucket across migration and
/// conversion; fails with `ObjectFreed` once the bytes are freed.
pub struct BucketReader {
    bucket: Arc<BucketInner>,
    pos: u64,
}

impl BucketReader {
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Close the stream (same as dropping it).
    pub fn close(self) {}
}

impl Read for BucketReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.bucket.read_at(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Drop for BucketReader {
    fn drop(&mut self) {
        self.bucket.release_reader();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::StorageFactory;
    use tierstore_core::config::FactoryConfig;

    fn factory(dir: &std::path::Path, cap: u64, total: u64) -> StorageFactory {
        let cfg = FactoryConfig {
            temp_dir: dir.to_path_buf(),
            max_ram_per_object: cap,
            max_ram_total: total,
            ..FactoryConfig::default()
        };
        StorageFactory::builder(cfg)
            .without_runner()
            .weak_seed(7)
            .build()
            .unwrap()
    }

    fn read_all(bucket: &TempBucket) -> Vec<u8> {
        let mut out = Vec::new();
        bucket.open_for_read().unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn small_bucket_stays_in_ram_and_shrinks_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path(), 1024, 4096);
        let bucket = f.make_bucket(512).unwrap();
        assert!(bucket.is_ram());
        assert_eq!(f.ram_used(), 512);

        let mut w = bucket.open_for_write().unwrap();
        w.write_all(b"hello").unwrap();
        w.close().unwrap();

        assert_eq!(bucket.write_phase(), WritePhase::Closed);
        assert_eq!(f.ram_used(), 5);
        assert_eq!(read_all(&bucket), b"hello");

        bucket.free().unwrap();
        assert_eq!(f.ram_used(), 0);
    }

    #[test]
    fn growth_past_cap_spills_mid_write() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path(), 16, 4096);
        let bucket = f.make_bucket(8).unwrap();
        let mut w = bucket.open_for_write().unwrap();
        w.write_all(&[1u8; 10]).unwrap();
        assert!(bucket.is_ram());
        w.write_all(&[2u8; 10]).unwrap();
        assert_eq!(bucket.tier(), Some(Tier::Disk));
        assert!(bucket.has_migrated());
        assert_eq!(f.ram_used(), 0);
        drop(w);

        let mut expected = vec![1u8; 10];
        expected.extend_from_slice(&[2u8; 10]);
        assert_eq!(read_all(&bucket), expected);
        let path = bucket.backing_path().unwrap();
        bucket.free().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn single_writer_and_no_reads_while_writing() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path(), 1024, 4096);
        let bucket = f.make_growable_bucket().unwrap();
        let mut w = bucket.open_for_write().unwrap();
        assert!(matches!(bucket.open_for_write(), Err(Error::ObjectBusy(_))));
        assert!(matches!(bucket.open_for_read(), Err(Error::ReadWhileOpenForWrite)));
        assert!(matches!(bucket.migrate_to_disk(), Err(Error::ObjectBusy(_))));
        w.close().unwrap();

        let err = w.write(b"late").unwrap_err();
        assert!(matches!(Error::from(err), Error::WriteAfterClose));
        assert!(matches!(bucket.open_for_write(), Err(Error::WriteAfterClose)));
        bucket.free().unwrap();
    }

    #[test]
    fn unwritten_bucket_rejects_read_side_calls() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path(), 1024, 4096);
        let bucket = f.make_bucket(100).unwrap();
        assert!(matches!(bucket.open_for_read(), Err(Error::ReadWhileOpenForWrite)));
        assert!(matches!(bucket.to_random_access_store(), Err(Error::ObjectBusy(_))));
        assert_eq!(bucket.write_phase(), WritePhase::Fresh);
        assert_eq!(f.ram_used(), 100);

        // Still writable afterwards.
        let mut w = bucket.open_for_write().unwrap();
        w.write_all(b"late start").unwrap();
        w.close().unwrap();
        assert_eq!(read_all(&bucket), b"late start");
        bucket.free().unwrap();
        assert_eq!(f.ram_used(), 0);
    }

    #[test]
    fn readers_are_independent_and_survive_migration() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path(), 1024, 4096);
        let bucket = f.make_bucket(64).unwrap();
        let mut w = bucket.open_for_write().unwrap();
        w.write_all(b"0123456789").unwrap();
        w.close().unwrap();

        let mut a = bucket.open_for_read().unwrap();
        let mut b = bucket.open_for_read().unwrap();
        let mut head = [0u8; 4];
        a.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"0123");

        assert!(bucket.migrate_to_disk().unwrap());
        assert!(!bucket.migrate_to_disk().unwrap());

        let mut rest = Vec::new();
        a.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"456789");
        let mut all = Vec::new();
        b.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"0123456789");
        assert_eq!(a.position(), 10);
        a.close();
        drop(b);
        bucket.free().unwrap();
    }

    #[test]
    fn free_is_idempotent_and_breaks_open_readers() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path(), 1024, 4096);
        let bucket = f.make_bucket(8).unwrap();
        let mut w = bucket.open_for_write().unwrap();
        w.write_all(b"abc").unwrap();
        drop(w);
        let mut r = bucket.open_for_read().unwrap();

        bucket.free().unwrap();
        bucket.free().unwrap();
        assert!(bucket.is_freed());
        assert_eq!(bucket.tier(), None);
        let mut buf = [0u8; 3];
        let err = r.read(&mut buf).unwrap_err();
        assert!(matches!(Error::from(err), Error::ObjectFreed));
        assert!(matches!(bucket.open_for_read(), Err(Error::ObjectFreed)));
        assert!(matches!(bucket.migrate_to_disk(), Err(Error::ObjectFreed)));
        assert_eq!(f.ram_used(), 0);
    }

    #[test]
    fn conversion_requires_no_open_streams() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path(), 1024, 4096);
        let bucket = f.make_bucket(8).unwrap();
        let mut w = bucket.open_for_write().unwrap();
        w.write_all(b"data").unwrap();
        assert!(matches!(bucket.to_random_access_store(), Err(Error::ObjectBusy(_))));
        w.close().unwrap();

        let r = bucket.open_for_read().unwrap();
        assert!(matches!(bucket.to_random_access_store(), Err(Error::ObjectBusy(_))));
        drop(r);

        let store = bucket.to_random_access_store().unwrap();
        assert_eq!(store.size(), 4);
        assert_eq!(store.id(), bucket.id());
        assert!(store.same_store(&bucket.to_random_access_store().unwrap()));
        assert!(matches!(bucket.open_for_write(), Err(Error::ReadOnlyAfterConversion)));

        store.pwrite(0, b"D").unwrap();
        assert_eq!(read_all(&bucket), b"Data");
        bucket.free().unwrap();
        assert!(store.is_freed());
        assert_eq!(f.ram_used(), 0);
    }

    #[test]
    fn failed_delete_still_frees() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(dir.path(), 1024, 4096);
        let bucket = f.make_bucket(64).unwrap();
        let mut w = bucket.open_for_write().unwrap();
        w.write_all(b"spill me").unwrap();
        w.close().unwrap();
        assert!(bucket.migrate_to_disk().unwrap());
        let mut r = bucket.open_for_read().unwrap();

        let path = bucket.backing_path().unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("pin"), b"x").unwrap();

        assert!(matches!(bucket.free(), Err(Error::Io(_))));
        assert!(bucket.is_freed());
        assert_eq!(f.ram_used(), 0);
        let mut buf = [0u8; 4];
        let err = r.read(&mut buf).unwrap_err();
        assert!(matches!(Error::from(err), Error::ObjectFreed));
        assert!(matches!(bucket.open_for_read(), Err(Error::ObjectFreed)));
        bucket.free().unwrap();
    }
}
