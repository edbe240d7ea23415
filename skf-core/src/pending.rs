//! Admission counters for in-flight proposals.
//!
//! One gate is shared by every group in the process. Tickets are acquired
//! before a proposal is enqueued and released when its future completes,
//! successfully or not.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{RaftError, Result};

pub struct PendingGate {
    writes: AtomicU64,
    write_bytes: AtomicU64,
    max_writes: u64,
    max_write_bytes: u64,
}

impl PendingGate {
    #[must_use]
    pub fn new(max_writes: u64, max_write_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            writes: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
            max_writes,
            max_write_bytes,
        })
    }

    /// Reserve one proposal of `size` bytes. Counters are incremented
    /// first and rolled back on rejection, matching the release ordering
    /// of the ticket drop.
    pub fn acquire(self: &Arc<Self>, size: u64) -> Result<PendingTicket> {
        let writes = self.writes.fetch_add(1, Ordering::AcqRel);
        if writes >= self.max_writes {
            self.writes.fetch_sub(1, Ordering::AcqRel);
            return Err(RaftError::Backpressure {
                resource: "pending writes",
                current: writes,
                max: self.max_writes,
            });
        }
        let bytes = self.write_bytes.fetch_add(size, Ordering::AcqRel);
        if bytes >= self.max_write_bytes {
            self.write_bytes.fetch_sub(size, Ordering::AcqRel);
            self.writes.fetch_sub(1, Ordering::AcqRel);
            return Err(RaftError::Backpressure {
                resource: "pending write bytes",
                current: bytes,
                max: self.max_write_bytes,
            });
        }
        Ok(PendingTicket {
            gate: Arc::clone(self),
            size,
        })
    }

    #[inline]
    #[must_use]
    pub fn pending_writes(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn pending_write_bytes(&self) -> u64 {
        self.write_bytes.load(Ordering::Acquire)
    }
}

/// RAII reservation in a [`PendingGate`].
pub struct PendingTicket {
    gate: Arc<PendingGate>,
    size: u64,
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        self.gate.writes.fetch_sub(1, Ordering::AcqRel);
        self.gate.write_bytes.fetch_sub(self.size, Ordering::AcqRel);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let gate = PendingGate::new(2, 100);
        let t1 = gate.acquire(10).unwrap();
        let t2 = gate.acquire(10).unwrap();
        assert_eq!(gate.pending_writes(), 2);
        assert!(gate.acquire(10).is_err());
        drop(t1);
        assert_eq!(gate.pending_writes(), 1);
        let _t3 = gate.acquire(10).unwrap();
        drop(t2);
        assert_eq!(gate.pending_write_bytes(), 10);
    }

    #[test]
    fn test_byte_limit_rolls_back_write_count() {
        let gate = PendingGate::new(10, 64);
        let _t = gate.acquire(64).unwrap();
        assert!(gate.acquire(1).is_err());
        assert_eq!(gate.pending_writes(), 1);
        assert_eq!(gate.pending_write_bytes(), 64);
    }

    #[test]
    fn test_counters_return_to_zero() {
        let gate = PendingGate::new(100, 1000);
        let tickets: Vec<_> = (0..50).map(|_| gate.acquire(7).unwrap()).collect();
        drop(tickets);
        assert_eq!(gate.pending_writes(), 0);
        assert_eq!(gate.pending_write_bytes(), 0);
    }
}
