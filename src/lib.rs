#![forbid(unsafe_code)]
//! tierstore: tiered RAM/disk scratch storage.
//!
//! Facade over the workspace crates. Most users only need `StorageFactory`
//! and the object types it returns.

pub use tierstore_temp::{
    BucketReader, BucketWriter, Error, FactoryBuilder, FactoryConfig, FactoryStats, Result,
    StorageFactory, TempBucket, TempRandomAccessStore, Tier, WritePhase,
};
