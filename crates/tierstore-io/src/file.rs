//! Disk-backed scratch store.
//!
//! One file per store, created with create-new semantics so a name can never
//! be shared with a live file. Access goes through the handle pool with
//! positional reads/writes, so concurrent readers need no seek coordination.
//! The file is deleted exactly once: by `delete`, by whoever took the path
//! from `detach`, or on drop as a leak safety net.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use tierstore_core::error::{Error, Result};
use tierstore_core::id::FileId;
use tierstore_core::names::TempName;

use crate::crypt::FileCipher;
use crate::pool::HandlePool;

const ZERO_CHUNK: usize = 64 * 1024;

#[derive(Debug)]
pub struct FileBackedStore {
    id: FileId,
    path: PathBuf,
    pool: Arc<HandlePool>,
    cipher: Option<FileCipher>,
    len: AtomicU64,
    deleted: AtomicBool,
}

impl FileBackedStore {
    /// Create the backing file. Fails with `AlreadyExists` (as `Error::Io`) if
    /// the name is taken; the caller should ask for another name.
    pub fn create(
        name: TempName,
        pool: Arc<HandlePool>,
        cipher: Option<FileCipher>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&name.path)?;
        pool.adopt(name.id, file);
        debug!(file = %name.id, path = %name.path.display(), encrypted = cipher.is_some(), "created scratch file");
        Ok(Self {
            id: name.id,
            path: name.path,
            pool,
            cipher,
            len: AtomicU64::new(0),
            deleted: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical length: highest byte written or the size set with `set_len`.
    pub fn length(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn handle(&self) -> Result<Arc<File>> {
        if self.is_deleted() {
            return Err(Error::ObjectFreed);
        }
        self.pool.open_or_reuse(self.id, &self.path)
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = self.length();
        let end = offset.checked_add(buf.len() as u64);
        if end.map_or(true, |end| end > len) {
            return Err(Error::OutOfRange {
                offset,
                len: buf.len() as u64,
                size: len,
            });
        }
        if buf.is_empty() {
            return Ok(());
        }
        let file = self.handle()?;
        positional::read_exact_at(&file, buf, offset)?;
        if let Some(cipher) = &self.cipher {
            cipher.apply(offset, buf)?;
        }
        Ok(())
    }

    /// Write all of `data` at `offset`, extending the logical length if needed.
    pub fn pwrite(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = offset.checked_add(data.len() as u64).ok_or(Error::OutOfRange {
            offset,
            len: data.len() as u64,
            size: u64::MAX,
        })?;
        let file = self.handle()?;
        match &self.cipher {
            Some(cipher) => {
                let mut enc = data.to_vec();
                cipher.apply(offset, &mut enc)?;
                positional::write_all_at(&file, &enc, offset)?;
            }
            None => positional::write_all_at(&file, data, offset)?,
        }
        self.len.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    /// Grow the file to `size` bytes of (plaintext) zeros. Never shrinks.
    pub fn set_len(&self, size: u64) -> Result<()> {
        let cur = self.length();
        if size <= cur {
            return Ok(());
        }
        if self.cipher.is_some() {
            // Zeros must be encrypted too, or they would read back as keystream.
            let zeros = vec![0u8; ZERO_CHUNK];
            let mut pos = cur;
            while pos < size {
                let n = (size - pos).min(ZERO_CHUNK as u64) as usize;
                self.pwrite(pos, &zeros[..n])?;
                pos += n as u64;
            }
        } else {
            self.handle()?.set_len(size)?;
            self.len.fetch_max(size, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.handle()?.sync_data()?;
        Ok(())
    }

    /// Release the pooled handle. The file stays; the next access reopens it.
    pub fn close(&self) {
        self.pool.release(self.id);
    }

    /// Delete the backing file. Returns false if it was already deleted.
    pub fn delete(&self) -> Result<bool> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.pool.release(self.id);
        remove_scratch_file(&self.path)?;
        debug!(file = %self.id, "deleted scratch file");
        Ok(true)
    }

    /// Mark the store deleted and hand the path to the caller, who becomes
    /// responsible for removing it (e.g. on a background thread).
    pub fn detach(&self) -> Option<PathBuf> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.pool.release(self.id);
        Some(self.path.clone())
    }
}

impl Drop for FileBackedStore {
    fn drop(&mut self) {
        if self.is_deleted() {
            return;
        }
        warn!(file = %self.id, path = %self.path.display(), "scratch file dropped without free; deleting");
        if let Err(e) = self.delete() {
            warn!(file = %self.id, error = %e, "failed to delete leaked scratch file");
        }
    }
}

/// Remove a scratch file; a file that is already gone counts as removed.
pub fn remove_scratch_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
mod positional {
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt;

    pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
        file.read_exact_at(buf, offset)
    }

    pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
        file.write_all_at(buf, offset)
    }
}

#[cfg(windows)]
mod positional {
    use std::fs::File;
    use std::io;
    use std::os::windows::fs::FileExt;

    pub fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match file.seek_read(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match file.seek_write(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn name(dir: &Path, id: u64) -> TempName {
        TempName {
            id: FileId::new(id),
            path: dir.join(format!("s-{id:016x}")),
        }
    }

    #[test]
    fn write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(HandlePool::new(4));
        let store = FileBackedStore::create(name(dir.path(), 1), Arc::clone(&pool), None).unwrap();
        store.pwrite(0, b"hello world").unwrap();
        assert_eq!(store.length(), 11);
        assert_eq!(fs::metadata(store.path()).unwrap().len(), 11);

        let mut buf = [0u8; 5];
        store.pread(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
        assert!(matches!(
            store.pread(8, &mut buf),
            Err(Error::OutOfRange { size: 11, .. })
        ));

        let path = store.path().to_path_buf();
        assert!(store.delete().unwrap());
        assert!(!store.delete().unwrap());
        assert!(!path.exists());
        assert!(matches!(store.pread(0, &mut buf), Err(Error::ObjectFreed)));
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn create_refuses_existing_name() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(HandlePool::new(4));
        let _a = FileBackedStore::create(name(dir.path(), 5), Arc::clone(&pool), None).unwrap();
        let err = FileBackedStore::create(name(dir.path(), 5), pool, None).unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::AlreadyExists),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn encrypted_bytes_differ_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(HandlePool::new(4));
        let cipher = FileCipher::generate(&mut ChaCha20Rng::seed_from_u64(3));
        let store = FileBackedStore::create(name(dir.path(), 2), pool, Some(cipher)).unwrap();
        store.set_len(32).unwrap();
        store.pwrite(4, b"secret").unwrap();

        let raw = fs::read(store.path()).unwrap();
        assert_eq!(raw.len(), 32);
        assert_ne!(&raw[4..10], b"secret");

        let mut all = [0xffu8; 32];
        store.pread(0, &mut all).unwrap();
        assert_eq!(&all[..4], &[0, 0, 0, 0]);
        assert_eq!(&all[4..10], b"secret");
        assert!(all[10..].iter().all(|b| *b == 0));
    }

    #[test]
    fn drop_without_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(HandlePool::new(4));
        let store = FileBackedStore::create(name(dir.path(), 3), pool, None).unwrap();
        let path = store.path().to_path_buf();
        drop(store);
        assert!(!path.exists());
    }

    #[test]
    fn reopens_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(HandlePool::new(4));
        let store = FileBackedStore::create(name(dir.path(), 4), Arc::clone(&pool), None).unwrap();
        store.pwrite(0, b"abc").unwrap();
        store.close();
        assert_eq!(pool.open_count(), 0);
        let mut buf = [0u8; 3];
        store.pread(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        store.delete().unwrap();
    }
}
