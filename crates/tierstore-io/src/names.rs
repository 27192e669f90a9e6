//! Scratch file naming.
//!
//! Names are `<prefix><16 hex digits>` inside one directory. The hex part is a
//! random `FileId` drawn from a weak RNG; it only has to avoid collisions, which
//! `FileBackedStore::create` enforces with create-new semantics.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, warn};

use tierstore_core::error::Result;
use tierstore_core::id::FileId;
use tierstore_core::names::{NameAllocator, TempName};

pub struct FilenameGenerator {
    dir: PathBuf,
    prefix: String,
    rng: Mutex<StdRng>,
}

impl FilenameGenerator {
    /// Create the generator, making `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, rng: StdRng) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            rng: Mutex::new(rng),
        })
    }

    /// Generator seeded from OS entropy.
    pub fn from_entropy(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        Self::new(dir, prefix, StdRng::from_entropy())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn path_for(&self, id: FileId) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, id.to_hex()))
    }

    /// Recover the id from a file name produced by this generator.
    pub fn parse_id(&self, file_name: &str) -> Option<FileId> {
        let hex = file_name.strip_prefix(&self.prefix)?;
        if hex.len() != 16 {
            return None;
        }
        u64::from_str_radix(hex, 16).ok().map(FileId::new)
    }

    /// Files in the directory that look like ours.
    pub fn list_leftovers(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let is_ours = entry
                .file_name()
                .to_str()
                .and_then(|name| self.parse_id(name))
                .is_some();
            if is_ours && entry.file_type()?.is_file() {
                out.push(entry.path());
            }
        }
        Ok(out)
    }

    /// Delete files left behind by an earlier process. Only safe before any
    /// store is created with this generator.
    pub fn wipe_leftovers(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.list_leftovers()? {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove leftover scratch file"),
            }
        }
        debug!(dir = %self.dir.display(), removed, "wiped leftover scratch files");
        Ok(removed)
    }
}

impl NameAllocator for FilenameGenerator {
    fn next_name(&self) -> TempName {
        let id = FileId::new(self.rng.lock().next_u64());
        TempName {
            id,
            path: self.path_for(id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_parse() {
        let dir = tempfile::tempdir().unwrap();
        let g = FilenameGenerator::new(dir.path(), "t-", StdRng::seed_from_u64(7)).unwrap();
        let a = g.next_name();
        let b = g.next_name();
        assert_ne!(a.id, b.id);

        let file_name = a.path.file_name().unwrap().to_str().unwrap();
        assert!(file_name.starts_with("t-"));
        assert_eq!(g.parse_id(file_name), Some(a.id));
        assert_eq!(g.parse_id("other-0000000000000001"), None);
        assert_eq!(g.parse_id("t-xyz"), None);
    }

    #[test]
    fn wipe_only_touches_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();
        let g = FilenameGenerator::new(dir.path(), "t-", StdRng::seed_from_u64(1)).unwrap();
        fs::write(g.next_name().path, b"x").unwrap();
        fs::write(g.next_name().path, b"y").unwrap();
        fs::write(dir.path().join("keep.txt"), b"z").unwrap();

        assert_eq!(g.list_leftovers().unwrap().len(), 2);
        assert_eq!(g.wipe_leftovers().unwrap(), 2);
        assert!(g.list_leftovers().unwrap().is_empty());
        assert!(dir.path().join("keep.txt").exists());
    }
}
