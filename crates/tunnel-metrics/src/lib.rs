//! Statistics primitives for tunnel processing.
//!
//! [`Counter`] tracks a running total plus a "recent" window that can be
//! drained with [`Counter::take_recent`]. [`Distribution`] records observed
//! values (count, sum, max) for rates such as padding excess per message.
//!
//! Everything is lock-free and uses [`Ordering::Relaxed`]: these numbers
//! feed diagnostics only and never influence message processing.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A monotonic event counter with a resettable recent window.
#[derive(Default)]
pub struct Counter {
    total: AtomicU64,
    /// Value of `total` when the recent window was last drained.
    mark: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event.
    pub fn inc(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `n` events.
    pub fn add(&self, n: u64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    /// All events since creation.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Events since the last [`take_recent`](Self::take_recent).
    pub fn recent(&self) -> u64 {
        self.total().saturating_sub(self.mark.load(Ordering::Relaxed))
    }

    /// Drain the recent window, returning how many events it held.
    pub fn take_recent(&self) -> u64 {
        let now = self.total();
        let before = self.mark.swap(now, Ordering::Relaxed);
        now.saturating_sub(before)
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("total", &self.total())
            .field("recent", &self.recent())
            .finish()
    }
}

impl Serialize for Counter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.total().serialize(serializer)
    }
}

/// Running summary of observed values.
#[derive(Default)]
pub struct Distribution {
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

/// Point-in-time copy of a [`Distribution`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionSnapshot {
    pub count: u64,
    pub sum: u64,
    pub max: u64,
}

impl DistributionSnapshot {
    /// Mean of the observed values, 0 when nothing was observed.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

impl Distribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DistributionSnapshot {
        DistributionSnapshot {
            count: self.count.load(Ordering::Relaxed),
            sum: self.sum.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.snapshot(), f)
    }
}

impl Serialize for Distribution {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}
