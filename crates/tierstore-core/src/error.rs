use std::io;

use thiserror::Error;

/// Canonical result for tierstore.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("RAM quota exceeded: requested {requested} bytes, capacity {capacity}, used {used}")]
    QuotaExceeded {
        requested: u64,
        capacity: u64,
        used: u64,
    },

    #[error("write after the output stream was closed")]
    WriteAfterClose,

    #[error("cannot read while the output stream is open")]
    ReadWhileOpenForWrite,

    #[error("object busy: {0}")]
    ObjectBusy(&'static str),

    #[error("object is read-only after conversion to a random-access store")]
    ReadOnlyAfterConversion,

    #[error("out of range: offset {offset} + len {len} exceeds size {size}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("object has been freed")]
    ObjectFreed,

    #[error("I/O failure: {0}")]
    Io(#[source] io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Error::OutOfRange { .. } => io::ErrorKind::InvalidInput,
            Error::ObjectBusy(_) => io::ErrorKind::WouldBlock,
            Error::WriteAfterClose | Error::ReadOnlyAfterConversion => {
                io::ErrorKind::PermissionDenied
            }
            Error::Io(e) => e.kind(),
            _ => io::ErrorKind::Other,
        }
    }
}

// Errors surface through `std::io::Read`/`Write` wrapped in `io::Error`.
// Converting back recovers the original variant.
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return Error::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => Error::Io(io::Error::new(kind, other)),
            None => Error::Io(io::Error::from(kind)),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
