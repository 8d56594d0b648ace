//! Session byte accounting.
//!
//! Every HTTP round trip performed by a session flows through one shared
//! [`ByteCounter`], so callers can report how much traffic a measurement
//! consumed. Counters only ever grow; they are reset by creating a new
//! session.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for bytes sent and received by a session.
///
/// Cheap to share: the session hands clones of an `Arc<ByteCounter>` to the
/// HTTP client and the resolver, and snapshots the totals into measurement
/// results.
#[derive(Debug, Default)]
pub struct ByteCounter {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ByteCounter {
    /// Creates a counter with both totals at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts for `count` bytes sent.
    pub fn count_sent(&self, count: u64) {
        self.sent.fetch_add(count, Ordering::Relaxed);
    }

    /// Accounts for `count` bytes received.
    pub fn count_received(&self, count: u64) {
        self.received.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns the total bytes sent so far.
    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Returns the total bytes received so far.
    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Returns the KiB sent so far.
    pub fn kibi_bytes_sent(&self) -> f64 {
        self.bytes_sent() as f64 / 1024.0
    }

    /// Returns the KiB received so far.
    pub fn kibi_bytes_received(&self) -> f64 {
        self.bytes_received() as f64 / 1024.0
    }
}
