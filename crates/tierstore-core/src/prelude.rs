//! Convenient re-exports for downstream crates.

pub use crate::budget::{RamQuota, Reservation};
pub use crate::config::FactoryConfig;
pub use crate::error::{Error, Result};
pub use crate::id::{FileId, ObjectId};
pub use crate::names::{NameAllocator, TempName};
pub use crate::runner::{Task, TaskRunner};
