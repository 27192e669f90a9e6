#![forbid(unsafe_code)]
//! tierstore-temp: tiered temp buckets and random-access stores.
//!
//! `StorageFactory` hands out two kinds of scratch objects:
//! - `TempBucket`: written once as a stream, then read any number of times.
//! - `TempRandomAccessStore`: fixed size, positional reads and writes.
//!
//! Small objects start in RAM, accounted against a global quota. Anything
//! over the per-object cap, or arriving while the quota is full, goes to a
//! scratch file. RAM objects can move to disk at any time (explicitly, while
//! growing past the cap, or under memory pressure) without callers noticing
//! beyond the changed tier.

pub mod bucket;
pub mod factory;
mod pressure;
pub mod stats;
pub mod store;

pub use bucket::{BucketReader, BucketWriter, TempBucket, WritePhase};
pub use factory::{FactoryBuilder, StorageFactory, Tier};
pub use stats::FactoryStats;
pub use store::TempRandomAccessStore;

pub use tierstore_core::config::FactoryConfig;
pub use tierstore_core::error::{Error, Result};
