//! StorageFactory: RAM quota, tier choice and scratch file lifecycle.
//!
//! The factory decides at creation time whether an object starts in RAM or on
//! disk, and owns everything objects share: the quota counter, the name
//! allocator, the handle pool, the strong RNG for file keys and the background
//! runner. It never owns the objects themselves; callers do.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tracing::{debug, trace, warn};

use tierstore_core::budget::RamQuota;
use tierstore_core::config::FactoryConfig;
use tierstore_core::error::{Error, Result};
use tierstore_core::id::ObjectId;
use tierstore_core::names::NameAllocator;
use tierstore_core::runner::TaskRunner;
use tierstore_io::{remove_scratch_file, FileBackedStore, FileCipher, FilenameGenerator, HandlePool, SerialExecutor};
use tierstore_mem::{RamBuffer, RamQuotaImpl};

use crate::bucket::TempBucket;
use crate::pressure::{Migratable, RamRegistry};
use crate::stats::{Counters, FactoryStats};
use crate::store::TempRandomAccessStore;

/// Attempts at finding an unused scratch file name before giving up.
const NAME_ATTEMPTS: usize = 16;

/// Where an object's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Tier {
    Ram,
    Disk,
}

pub(crate) enum Placement {
    Ram(RamBuffer),
    Disk(FileBackedStore),
}

#[derive(Clone, Copy)]
enum Shape {
    /// Growable, starts empty with the size reserved.
    Bucket,
    /// Fixed size, zero-filled.
    Store,
}

pub(crate) struct FactoryShared {
    config: FactoryConfig,
    quota: RamQuotaImpl,
    names: Arc<dyn NameAllocator>,
    pool: Arc<HandlePool>,
    runner: Option<Arc<dyn TaskRunner>>,
    strong_rng: Mutex<ChaCha20Rng>,
    next_object: AtomicU64,
    registry: RamRegistry,
    relief_pending: AtomicBool,
    pub(crate) counters: Counters,
}

impl FactoryShared {
    pub(crate) fn config(&self) -> &FactoryConfig {
        &self.config
    }

    pub(crate) fn ram_used(&self) -> u64 {
        self.quota.used_bytes()
    }

    fn next_id(&self) -> ObjectId {
        ObjectId::new(self.next_object.fetch_add(1, Ordering::Relaxed))
    }

    /// Choose the tier for a new object of `bytes` and allocate its backing.
    fn place(self: &Arc<Self>, bytes: u64, shape: Shape) -> Result<Placement> {
        if bytes <= self.config.max_ram_per_object {
            let attempt = match shape {
                Shape::Bucket => RamBuffer::with_estimate(&self.quota, bytes, "bucket"),
                Shape::Store => RamBuffer::zeroed(&self.quota, bytes, "store"),
            };
            match attempt {
                Ok(buf) => {
                    trace!(bytes, used = self.ram_used(), "reserved RAM");
                    Counters::bump(&self.counters.ram_created);
                    self.note_ram_growth();
                    return Ok(Placement::Ram(buf));
                }
                Err(Error::QuotaExceeded { .. }) if self.config.disk_fallback => {
                    debug!(bytes, used = self.ram_used(), "RAM quota full; placing on disk");
                    self.schedule_relief();
                }
                Err(e) => return Err(e),
            }
        }

        let file = self.create_file()?;
        if let Shape::Store = shape {
            file.set_len(bytes)?;
        }
        Counters::bump(&self.counters.disk_created);
        Ok(Placement::Disk(file))
    }

    /// New scratch file under a fresh name, encrypted if configured.
    pub(crate) fn create_file(&self) -> Result<FileBackedStore> {
        for _ in 0..NAME_ATTEMPTS {
            let name = self.names.next_name();
            let cipher = self
                .config
                .encrypt_on_disk
                .then(|| FileCipher::generate(&mut *self.strong_rng.lock()));
            match FileBackedStore::create(name, Arc::clone(&self.pool), cipher) {
                Ok(file) => return Ok(file),
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "no free scratch file name",
        )))
    }

    /// Delete a freed object's file, inline or on the background runner.
    /// The object is already in its freed state when this runs.
    pub(crate) fn dispose_file(&self, file: FileBackedStore) -> Result<()> {
        if self.config.async_delete {
            if let Some(runner) = &self.runner {
                if let Some(path) = file.detach() {
                    Counters::bump(&self.counters.files_deleted);
                    runner.execute(Box::new(move || {
                        if let Err(e) = remove_scratch_file(&path) {
                            warn!(path = %path.display(), error = %e, "background delete failed");
                        }
                    }));
                }
                return Ok(());
            }
        }
        if file.delete()? {
            Counters::bump(&self.counters.files_deleted);
        }
        Ok(())
    }

    pub(crate) fn record_migration(&self, id: ObjectId, bytes: u64, kind: &'static str) {
        Counters::bump(&self.counters.migrations);
        debug!(object = %id, bytes, kind, used = self.ram_used(), "migrated to disk");
    }

    pub(crate) fn track_ram_object(
        self: &Arc<Self>,
        id: ObjectId,
        created: Instant,
        object: Weak<dyn Migratable>,
    ) {
        let oldest = self.registry.register(id, created, object);
        if oldest >= self.max_ram_age() {
            self.schedule_relief();
        }
    }

    /// Called after a RAM object grew its reservation, with no object lock held.
    pub(crate) fn note_ram_growth(self: &Arc<Self>) {
        if self.ram_used() > self.config.high_watermark_bytes() {
            self.schedule_relief();
        }
    }

    fn max_ram_age(&self) -> Duration {
        Duration::from_secs(self.config.ram_max_age_secs)
    }

    /// Queue one relief pass on the runner; at most one is pending at a time.
    fn schedule_relief(self: &Arc<Self>) {
        let Some(runner) = &self.runner else {
            return;
        };
        if self.relief_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(self);
        runner.execute(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.relief_pending.store(false, Ordering::Release);
                shared.relieve_pressure();
            }
        }));
    }

    pub(crate) fn relieve_pressure(&self) -> usize {
        let migrated = self.registry.relieve(
            self.max_ram_age(),
            self.config.low_watermark_bytes(),
            || self.ram_used(),
        );
        if migrated > 0 {
            debug!(migrated, used = self.ram_used(), "relief pass finished");
        }
        migrated
    }
}

/// Entry point: creates temp buckets and random-access stores.
#[derive(Clone)]
pub struct StorageFactory {
    shared: Arc<FactoryShared>,
}

impl std::fmt::Debug for StorageFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageFactory")
            .field("ram_used", &self.ram_used())
            .field("max_ram_total", &self.shared.config.max_ram_total)
            .finish()
    }
}

impl StorageFactory {
    /// Factory with default collaborators: a `FilenameGenerator` in
    /// `config.temp_dir`, OS-seeded RNGs and a background `SerialExecutor`.
    pub fn new(config: FactoryConfig) -> Result<Self> {
        FactoryBuilder::new(config).build()
    }

    pub fn builder(config: FactoryConfig) -> FactoryBuilder {
        FactoryBuilder::new(config)
    }

    /// New write-once bucket. `expected_size` is reserved up front when the
    /// bucket starts in RAM.
    pub fn make_bucket(&self, expected_size: u64) -> Result<TempBucket> {
        let id = self.shared.next_id();
        let placement = self.shared.place(expected_size, Shape::Bucket)?;
        Counters::bump(&self.shared.counters.buckets_created);
        debug!(object = %id, expected_size, tier = ?tier_of(&placement), "made bucket");
        Ok(TempBucket::new(id, Arc::clone(&self.shared), placement))
    }

    /// New bucket of unknown final size, reserving `default_bucket_estimate`.
    pub fn make_growable_bucket(&self) -> Result<TempBucket> {
        self.make_bucket(self.shared.config.default_bucket_estimate)
    }

    /// New fixed-size, zero-filled random-access store.
    pub fn make_random_access_store(&self, size: u64) -> Result<TempRandomAccessStore> {
        let id = self.shared.next_id();
        let placement = self.shared.place(size, Shape::Store)?;
        Counters::bump(&self.shared.counters.stores_created);
        debug!(object = %id, size, tier = ?tier_of(&placement), "made random-access store");
        Ok(TempRandomAccessStore::new(
            id,
            size,
            Arc::clone(&self.shared),
            placement,
            Instant::now(),
            false,
        ))
    }

    /// Bytes currently attributed to live RAM-tier objects.
    pub fn ram_used(&self) -> u64 {
        self.shared.ram_used()
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.shared.config
    }

    /// Migrate old or excess RAM objects now. Returns how many moved.
    pub fn relieve_pressure(&self) -> usize {
        self.shared.relieve_pressure()
    }

    pub fn stats(&self) -> FactoryStats {
        let s = &self.shared;
        let quota = s.quota.snapshot();
        FactoryStats {
            ram_used: quota.used,
            peak_ram_used: quota.peak,
            ram_capacity: quota.capacity,
            buckets_created: Counters::get(&s.counters.buckets_created),
            stores_created: Counters::get(&s.counters.stores_created),
            ram_created: Counters::get(&s.counters.ram_created),
            disk_created: Counters::get(&s.counters.disk_created),
            migrations: Counters::get(&s.counters.migrations),
            files_deleted: Counters::get(&s.counters.files_deleted),
            open_handles: s.pool.open_count(),
            tracked_ram_objects: s.registry.len(),
        }
    }
}

fn tier_of(p: &Placement) -> Tier {
    match p {
        Placement::Ram(_) => Tier::Ram,
        Placement::Disk(_) => Tier::Disk,
    }
}

/// Builder for injecting collaborators (fixed seeds, inline runner, custom names).
pub struct FactoryBuilder {
    config: FactoryConfig,
    names: Option<Arc<dyn NameAllocator>>,
    runner: Option<Option<Arc<dyn TaskRunner>>>,
    weak_seed: Option<u64>,
    strong_rng: Option<ChaCha20Rng>,
}

impl FactoryBuilder {
    pub fn new(config: FactoryConfig) -> Self {
        Self {
            config,
            names: None,
            runner: None,
            weak_seed: None,
            strong_rng: None,
        }
    }

    pub fn names(mut self, names: Arc<dyn NameAllocator>) -> Self {
        self.names = Some(names);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = Some(Some(runner));
        self
    }

    /// No background runner: deletes are inline and relief only runs on demand.
    pub fn without_runner(mut self) -> Self {
        self.runner = Some(None);
        self
    }

    /// Seed for the filename RNG.
    pub fn weak_seed(mut self, seed: u64) -> Self {
        self.weak_seed = Some(seed);
        self
    }

    /// Source of per-file key material.
    pub fn strong_rng(mut self, rng: ChaCha20Rng) -> Self {
        self.strong_rng = Some(rng);
        self
    }

    pub fn build(self) -> Result<StorageFactory> {
        self.config.validate()?;

        let names: Arc<dyn NameAllocator> = match self.names {
            Some(names) => names,
            None => {
                let weak = match self.weak_seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                Arc::new(FilenameGenerator::new(
                    &self.config.temp_dir,
                    self.config.file_prefix.clone(),
                    weak,
                )?)
            }
        };

        let runner: Option<Arc<dyn TaskRunner>> = match self.runner {
            Some(runner) => runner,
            None => Some(Arc::new(SerialExecutor::new("tierstore-bg")?)),
        };

        let strong = self.strong_rng.unwrap_or_else(ChaCha20Rng::from_entropy);

        debug!(
            temp_dir = %self.config.temp_dir.display(),
            max_ram_total = self.config.max_ram_total,
            max_ram_per_object = self.config.max_ram_per_object,
            encrypt = self.config.encrypt_on_disk,
            "storage factory ready"
        );

        Ok(StorageFactory {
            shared: Arc::new(FactoryShared {
                quota: RamQuotaImpl::new(self.config.max_ram_total),
                pool: Arc::new(HandlePool::new(self.config.max_open_files)),
                config: self.config,
                names,
                runner,
                strong_rng: Mutex::new(strong),
                next_object: AtomicU64::new(0),
                registry: RamRegistry::new(),
                relief_pending: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        })
    }
}
