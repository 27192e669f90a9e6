//! Pooled file handles.
//!
//! Scratch stores do not keep a file descriptor for their whole lifetime. They
//! ask the pool for a handle on each access; the pool keeps at most
//! `max_open` handles and closes the least recently used one beyond that.
//! Callers holding an `Arc<File>` keep it usable until they drop it.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use tierstore_core::error::Result;
use tierstore_core::id::FileId;

struct Entry {
    file: Arc<File>,
    last_used: u64,
}

#[derive(Default)]
struct PoolInner {
    open: HashMap<FileId, Entry>,
    clock: u64,
    reopened: u64,
}

pub struct HandlePool {
    max_open: usize,
    inner: Mutex<PoolInner>,
}

impl std::fmt::Debug for HandlePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlePool")
            .field("max_open", &self.max_open)
            .field("open", &self.open_count())
            .finish()
    }
}

impl HandlePool {
    pub fn new(max_open: usize) -> Self {
        Self {
            max_open: max_open.max(1),
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Register a handle the caller just opened (typically with create-new).
    pub fn adopt(&self, id: FileId, file: File) -> Arc<File> {
        let file = Arc::new(file);
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let last_used = inner.clock;
        inner.open.insert(
            id,
            Entry {
                file: Arc::clone(&file),
                last_used,
            },
        );
        Self::evict(&mut inner, self.max_open, id);
        file
    }

    /// Return the pooled handle for `id`, reopening `path` if it was evicted.
    ///
    /// The open itself happens without the pool lock held. If another thread
    /// reopened the same file meanwhile, its handle wins and ours is dropped.
    pub fn open_or_reuse(&self, id: FileId, path: &Path) -> Result<Arc<File>> {
        if let Some(file) = self.touch(id) {
            return Ok(file);
        }

        let opened = Arc::new(OpenOptions::new().read(true).write(true).open(path)?);

        let mut inner = self.inner.lock();
        inner.clock += 1;
        let now = inner.clock;
        if let Some(entry) = inner.open.get_mut(&id) {
            entry.last_used = now;
            return Ok(Arc::clone(&entry.file));
        }
        inner.reopened += 1;
        trace!(file = %id, "reopened pooled handle");
        inner.open.insert(
            id,
            Entry {
                file: Arc::clone(&opened),
                last_used: now,
            },
        );
        Self::evict(&mut inner, self.max_open, id);
        Ok(opened)
    }

    fn touch(&self, id: FileId) -> Option<Arc<File>> {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let now = inner.clock;
        inner.open.get_mut(&id).map(|entry| {
            entry.last_used = now;
            Arc::clone(&entry.file)
        })
    }

    /// Drop the pooled handle for `id`. Returns whether one was open.
    pub fn release(&self, id: FileId) -> bool {
        self.inner.lock().open.remove(&id).is_some()
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().open.len()
    }

    /// Number of handles that had to be reopened after eviction or release.
    pub fn reopen_count(&self) -> u64 {
        self.inner.lock().reopened
    }

    pub fn max_open(&self) -> usize {
        self.max_open
    }

    fn evict(inner: &mut PoolInner, max_open: usize, keep: FileId) {
        while inner.open.len() > max_open {
            let victim = inner
                .open
                .iter()
                .filter(|(id, _)| **id != keep)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    inner.open.remove(&id);
                    trace!(file = %id, "evicted pooled handle");
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        let pool = HandlePool::new(2);
        let paths: Vec<_> = (0..3).map(|i| dir.path().join(format!("f{i}"))).collect();
        for (i, p) in paths.iter().enumerate() {
            std::fs::write(p, b"data").unwrap();
            pool.open_or_reuse(FileId::new(i as u64), p).unwrap();
        }
        assert_eq!(pool.open_count(), 2);
        assert_eq!(pool.reopen_count(), 3);

        // f0 was evicted; touching it reopens and evicts f1.
        pool.open_or_reuse(FileId::new(0), &paths[0]).unwrap();
        assert_eq!(pool.reopen_count(), 4);
        pool.open_or_reuse(FileId::new(2), &paths[2]).unwrap();
        assert_eq!(pool.reopen_count(), 4);
    }

    #[test]
    fn release_closes_handle() {
        let dir = tempfile::tempdir().unwrap();
        let pool = HandlePool::new(4);
        let path = dir.path().join("f");
        let file = File::create(&path).unwrap();
        pool.adopt(FileId::new(9), file);
        assert!(pool.release(FileId::new(9)));
        assert!(!pool.release(FileId::new(9)));
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn concurrent_reopens_share_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let pool = HandlePool::new(8);
        let path = dir.path().join("shared");
        std::fs::write(&path, b"data").unwrap();
        let id = FileId::new(5);

        let handles: Vec<Arc<File>> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| pool.open_or_reuse(id, &path).unwrap()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(pool.open_count(), 1);
        assert_eq!(pool.reopen_count(), 1);
        let pooled = pool.open_or_reuse(id, &path).unwrap();
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &pooled)));
    }
}
