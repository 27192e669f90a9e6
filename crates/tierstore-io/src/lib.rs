#![forbid(unsafe_code)]
//! tierstore-io: everything that touches the filesystem or a thread.
//!
//! - `file`: `FileBackedStore`, one scratch file with positional IO.
//! - `pool`: bounded pool of open file handles.
//! - `names`: collision-free scratch file names.
//! - `crypt`: optional at-rest encryption.
//! - `executor`: background task runners.

pub mod crypt;
pub mod executor;
pub mod file;
pub mod names;
pub mod pool;

pub use crypt::FileCipher;
pub use executor::{InlineExecutor, SerialExecutor};
pub use file::{remove_scratch_file, FileBackedStore};
pub use names::FilenameGenerator;
pub use pool::HandlePool;
