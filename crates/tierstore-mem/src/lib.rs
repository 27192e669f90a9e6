#![forbid(unsafe_code)]
//! tierstore-mem: hard RAM quota and quota-backed buffers.
//!
//! This crate provides concrete implementations for the *interfaces* defined
//! in `tierstore-core::budget`. Every RAM-tier byte in tierstore flows through
//! a `RamBuffer` so the ceiling is enforced with RAII reservations.
//!
//! No file IO lives here.

pub mod buffer;
pub mod guard;
pub mod tracking;

pub use buffer::RamBuffer;
pub use guard::{QuotaSnapshot, RamQuotaImpl, RamReservation};
pub use tracking::PeakTracker;
