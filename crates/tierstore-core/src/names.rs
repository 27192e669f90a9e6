//! Temporary file naming interface.
//!
//! Implemented by `tierstore-io::names::FilenameGenerator`.

use std::path::PathBuf;

use crate::id::FileId;

/// A freshly allocated scratch file identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempName {
    pub id: FileId,
    pub path: PathBuf,
}

/// Produces scratch file names that do not collide with any live file.
///
/// The allocator only proposes a name; the caller creates the file with
/// create-new semantics and asks again on `AlreadyExists`.
pub trait NameAllocator: Send + Sync {
    fn next_name(&self) -> TempName;
}
