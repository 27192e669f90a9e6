//! Abstract RAM quota interfaces.
//!
//! The concrete implementation lives in `tierstore-mem`. We keep only traits here
//! so any crate can depend on the API without pulling the accounting logic.

/// A reservation returned by a RAM quota when bytes are acquired.
///
/// The concrete type lives in `tierstore-mem`. It must be RAII (releases on Drop),
/// `Send`, and `panic`-safe.
pub trait Reservation: Send + Sync {
    /// Number of bytes currently accounted for by this reservation.
    fn bytes(&self) -> u64;
    /// Optional debug tag for tracing.
    fn tag(&self) -> &'static str {
        "reservation"
    }
}

/// A handle representing the process-wide RAM ceiling.
///
/// Implemented by `tierstore-mem`. The factory calls `try_reserve` before
/// placing an object in RAM. If `None` is returned, the object goes to disk.
pub trait RamQuota: Send + Sync + 'static {
    type Reservation: Reservation;

    /// Attempt to reserve `bytes` from the live quota. Never blocks.
    fn try_reserve(&self, bytes: u64, tag: &'static str) -> Option<Self::Reservation>;

    /// Total configured capacity (bytes).
    fn capacity_bytes(&self) -> u64;

    /// Bytes currently attributed to live reservations.
    fn used_bytes(&self) -> u64;
}

// NOTE: Do *not* add default impls here that would silently "allow" reservations.
// The mem crate is the only place where reservations should be constructed.
