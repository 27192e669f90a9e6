//! Fixed-size random-access stores across both tiers

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use tierstore_core::config::FactoryConfig;
use tierstore_io::FilenameGenerator;
use tierstore_temp::{Error, StorageFactory, Tier};

fn test_factory(dir: &Path, cap: u64, total: u64) -> StorageFactory {
    let cfg = FactoryConfig {
        temp_dir: dir.to_path_buf(),
        max_ram_per_object: cap,
        max_ram_total: total,
        ..FactoryConfig::default()
    };
    StorageFactory::builder(cfg)
        .without_runner()
        .build()
        .expect("factory")
}

fn leftovers(dir: &Path) -> usize {
    FilenameGenerator::from_entropy(dir, "temp-")
        .and_then(|g| g.list_leftovers())
        .expect("list leftovers")
        .len()
}

#[test]
fn test_mixed_sizes_pick_tiers_and_clean_up() {
    let dir = tempfile::tempdir().unwrap();
    let factory = test_factory(dir.path(), 65536, 2 * 1024 * 1024);
    let sizes = [0u64, 1, 32, 64, 32768, 1048576, 1048577];

    let stores: Vec<_> = sizes
        .iter()
        .map(|&s| factory.make_random_access_store(s).expect("store"))
        .collect();

    for (store, &size) in stores.iter().zip(&sizes) {
        assert_eq!(store.size(), size);
        let expected = if size > 65536 { Tier::Disk } else { Tier::Ram };
        assert_eq!(store.tier(), Some(expected), "size {}", size);
    }
    assert_eq!(factory.ram_used(), 1 + 32 + 64 + 32768);

    for store in &stores {
        store.free().unwrap();
    }
    assert_eq!(factory.ram_used(), 0);
    assert_eq!(leftovers(dir.path()), 0);
}

#[test]
fn test_zero_length_store_accounts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let factory = test_factory(dir.path(), 1024, 4096);
    let store = factory.make_random_access_store(0).unwrap();
    assert_eq!(factory.ram_used(), 0);
    store.pread(0, &mut []).unwrap();
    assert!(matches!(
        store.pwrite(0, b"x"),
        Err(Error::OutOfRange { .. })
    ));
    assert!(store.migrate_to_disk().unwrap());
    assert_eq!(std::fs::metadata(store.backing_path().unwrap()).unwrap().len(), 0);
    store.free().unwrap();
}

#[test]
fn test_random_writes_match_model_across_migration() {
    let dir = tempfile::tempdir().unwrap();
    let factory = test_factory(dir.path(), 64 * 1024, 1024 * 1024);
    let mut rng = StdRng::seed_from_u64(0xfeed);
    let size = 40_000usize;
    let store = factory.make_random_access_store(size as u64).unwrap();
    let mut model = vec![0u8; size];

    for round in 0..200 {
        if round == 100 {
            assert!(store.migrate_to_disk().unwrap());
            assert_eq!(factory.ram_used(), 0);
        }
        let offset = rng.gen_range(0..size);
        let len = rng.gen_range(0..=(size - offset).min(2048));
        let mut patch = vec![0u8; len];
        rng.fill(&mut patch[..]);
        store.pwrite(offset as u64, &patch).unwrap();
        model[offset..offset + len].copy_from_slice(&patch);

        let check = rng.gen_range(0..size);
        let mut buf = vec![0u8; (size - check).min(512)];
        store.pread(check as u64, &mut buf).unwrap();
        assert_eq!(buf, model[check..check + buf.len()]);
    }

    let mut all = vec![0u8; size];
    store.pread(0, &mut all).unwrap();
    assert_eq!(all, model);
    store.free().unwrap();
}

#[test]
fn test_handle_pool_reopens_closed_files() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = FactoryConfig {
        temp_dir: dir.path().to_path_buf(),
        max_ram_per_object: 16,
        max_ram_total: 1024,
        max_open_files: 2,
        ..FactoryConfig::default()
    };
    let factory = StorageFactory::builder(cfg).without_runner().build().unwrap();
    let stores: Vec<_> = (0..6)
        .map(|i| {
            let s = factory.make_random_access_store(100).unwrap();
            s.pwrite(0, &[i as u8; 100]).unwrap();
            s
        })
        .collect();
    assert!(factory.stats().open_handles <= 2);

    for (i, s) in stores.iter().enumerate() {
        let mut buf = [0u8; 100];
        s.pread(0, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == i as u8));
        s.close();
    }
    for s in &stores {
        s.free().unwrap();
    }
    assert_eq!(factory.stats().open_handles, 0);
    assert_eq!(leftovers(dir.path()), 0);
}
