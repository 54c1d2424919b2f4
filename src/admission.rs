//! Connection admission control.
//!
//! A single shared counter bounds how many connections may exist across all
//! acceptors and event loops. Acceptors take a slot before handing a socket
//! to a worker; the owning worker gives it back when the channel is torn
//! down. Rejecting at accept time is the only transport-level overload
//! shedding the server performs.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Lock-free bounded counter of live connections.
pub struct ConnectionLimiter {
    current: AtomicUsize,
    max: usize,
}

impl ConnectionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            max,
        }
    }

    /// Claim one connection slot.
    ///
    /// Returns `false` when the ceiling has been reached; the counter is
    /// never incremented past `max`.
    pub fn try_acquire(&self) -> bool {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < self.max {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Give a slot back. Saturates at zero.
    pub fn release(&self) {
        let result = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if result.is_err() {
            warn!("connection slot released with no connections outstanding");
        }
    }

    /// Number of slots currently claimed.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Configured ceiling.
    pub fn max(&self) -> usize {
        self.max
    }
}
