//! Counters describing how much work a group deduplicated.

use crate::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct FlightStats {
    executions: AtomicU64,
    joins: AtomicU64,
    forgets: AtomicU64,
    panics: AtomicU64,
}

impl FlightStats {
    pub(crate) fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_join(&self) {
        self.joins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forget(&self) {
        self.forgets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            forgets: self.forgets.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`FlightStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Number of times a work function was started by a leader.
    pub executions: u64,
    /// Number of callers that joined an execution already in flight.
    pub joins: u64,
    /// Number of `forget` calls that removed an entry.
    pub forgets: u64,
    /// Number of executions that panicked or were abandoned.
    pub panics: u64,
}

impl StatsSnapshot {
    /// Fraction of calls that were served by somebody else's execution.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn dedup_ratio(&self) -> f64 {
        let total = self.executions + self.joins;
        if total == 0 {
            0.0
        } else {
            self.joins as f64 / total as f64
        }
    }
}
