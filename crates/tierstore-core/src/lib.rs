#![forbid(unsafe_code)]
//! tierstore-core: shared types for the tiered ephemeral storage manager.
//!
//! Errors, configuration, identifiers and the collaborator traits (RAM quota,
//! name allocation, background tasks). No IO or threads live here.

pub mod budget;
pub mod config;
pub mod error;
pub mod id;
pub mod names;
pub mod prelude;
pub mod runner;

pub use error::{Error, Result};
