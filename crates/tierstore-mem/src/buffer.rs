//! Quota-backed byte buffers for RAM-tier objects.
//!
//! All RAM-tier bytes are held in a `RamBuffer` so the quota always reflects
//! what is live. The reservation may be larger than the content (a growable
//! bucket reserves its estimate up front), never smaller.

use std::ops::Deref;

use tierstore_core::budget::{RamQuota, Reservation};
use tierstore_core::error::{Error, Result};

use crate::guard::RamReservation;

/// Owned byte buffer that returns its accounted bytes on drop via the reservation.
pub struct RamBuffer {
    reservation: RamReservation,
    buf: Vec<u8>,
}

impl std::fmt::Debug for RamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamBuffer")
            .field("len", &self.buf.len())
            .field("reserved", &self.reservation.bytes())
            .finish()
    }
}

fn reserve(
    quota: &impl RamQuota<Reservation = RamReservation>,
    bytes: u64,
    tag: &'static str,
) -> Result<RamReservation> {
    quota
        .try_reserve(bytes, tag)
        .ok_or_else(|| Error::QuotaExceeded {
            requested: bytes,
            capacity: quota.capacity_bytes(),
            used: quota.used_bytes(),
        })
}

fn to_usize(bytes: u64) -> Result<usize> {
    usize::try_from(bytes).map_err(|_| Error::QuotaExceeded {
        requested: bytes,
        capacity: usize::MAX as u64,
        used: 0,
    })
}

impl RamBuffer {
    /// Fixed-length zeroed buffer of `len` bytes, accounted against `quota`.
    pub fn zeroed(
        quota: &impl RamQuota<Reservation = RamReservation>,
        len: u64,
        tag: &'static str,
    ) -> Result<Self> {
        let n = to_usize(len)?;
        let reservation = reserve(quota, len, tag)?;
        Ok(Self {
            reservation,
            buf: vec![0u8; n],
        })
    }

    /// Empty buffer with `estimate` bytes reserved up front.
    pub fn with_estimate(
        quota: &impl RamQuota<Reservation = RamReservation>,
        estimate: u64,
        tag: &'static str,
    ) -> Result<Self> {
        let n = to_usize(estimate)?;
        let reservation = reserve(quota, estimate, tag)?;
        Ok(Self {
            reservation,
            buf: Vec::with_capacity(n),
        })
    }

    /// Content length in bytes.
    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes currently charged to the quota.
    pub fn accounted_bytes(&self) -> u64 {
        self.reservation.bytes()
    }

    /// Append `data`, growing the reservation if the content outgrows it.
    ///
    /// Returns false without appending if the grown size would exceed `cap`
    /// or the quota cannot supply the extra bytes. The caller then migrates.
    pub fn try_append(&mut self, data: &[u8], cap: u64) -> bool {
        let needed = self.len() + data.len() as u64;
        if needed > self.reservation.bytes()
            && (needed > cap || !self.reservation.try_resize(needed))
        {
            return false;
        }
        self.buf.extend_from_slice(data);
        true
    }

    /// Shrink the reservation to the content length. Called when writing ends.
    pub fn fit(&mut self) {
        let len = self.len();
        self.reservation.try_resize(len);
        self.buf.shrink_to_fit();
    }

    /// Copy out up to `out.len()` bytes starting at `offset`. Returns bytes copied.
    pub fn read_at(&self, offset: u64, out: &mut [u8]) -> usize {
        let start = match usize::try_from(offset) {
            Ok(s) if s < self.buf.len() => s,
            _ => return 0,
        };
        let n = out.len().min(self.buf.len() - start);
        out[..n].copy_from_slice(&self.buf[start..start + n]);
        n
    }

    /// Overwrite bytes in place. The range must lie within the content.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let size = self.len();
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= size)
            .ok_or(Error::OutOfRange {
                offset,
                len: data.len() as u64,
                size,
            })?;
        // end <= buf.len(), so both fit in usize.
        self.buf[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }
}

impl Deref for RamBuffer {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}
