//! Server-wide transaction counters.
//!
//! The active/inactive gauges are updated without holding the session
//! mutex on every path, so slight transient inaccuracies between them
//! are accepted.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonic totals and live gauges for multi-statement transactions.
#[derive(Debug, Default)]
pub struct ServerTransactionsMetrics {
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
    current_open: AtomicI64,
    current_active: AtomicI64,
    current_inactive: AtomicI64,
}

/// Point-in-time copy of the counters, for server status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransactionsMetricsSnapshot {
    /// Transactions ever started.
    pub total_started: u64,
    /// Transactions ever committed.
    pub total_committed: u64,
    /// Transactions ever aborted.
    pub total_aborted: u64,
    /// Transactions currently open (started, not yet terminated).
    pub current_open: i64,
    /// Open transactions currently attached to an operation.
    pub current_active: i64,
    /// Open transactions currently stashed between round trips.
    pub current_inactive: i64,
}

impl ServerTransactionsMetrics {
    /// Count a transaction start.
    pub fn increment_total_started(&self) {
        self.total_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a commit.
    pub fn increment_total_committed(&self) {
        self.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an abort.
    pub fn increment_total_aborted(&self) {
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// A transaction opened.
    pub fn increment_current_open(&self) {
        self.current_open.fetch_add(1, Ordering::Relaxed);
    }

    /// A transaction terminated.
    pub fn decrement_current_open(&self) {
        self.current_open.fetch_sub(1, Ordering::Relaxed);
    }

    /// A transaction became active on an operation.
    pub fn increment_current_active(&self) {
        self.current_active.fetch_add(1, Ordering::Relaxed);
    }

    /// A transaction stopped being active.
    pub fn decrement_current_active(&self) {
        self.current_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// A transaction was stashed.
    pub fn increment_current_inactive(&self) {
        self.current_inactive.fetch_add(1, Ordering::Relaxed);
    }

    /// A stashed transaction was resumed or terminated.
    pub fn decrement_current_inactive(&self) {
        self.current_inactive.fetch_sub(1, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> TransactionsMetricsSnapshot {
        TransactionsMetricsSnapshot {
            total_started: self.total_started.load(Ordering::Relaxed),
            total_committed: self.total_committed.load(Ordering::Relaxed),
            total_aborted: self.total_aborted.load(Ordering::Relaxed),
            current_open: self.current_open.load(Ordering::Relaxed),
            current_active: self.current_active.load(Ordering::Relaxed),
            current_inactive: self.current_inactive.load(Ordering::Relaxed),
        }
    }
}

/// Counters for the retryable-writes machinery.
#[derive(Debug, Default)]
pub struct RetryableWritesStats {
    transactions_collection_write_count: AtomicU64,
}

impl RetryableWritesStats {
    /// Count one write to the session-records collection.
    pub fn increment_transactions_collection_write_count(&self) {
        self.transactions_collection_write_count
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Writes made to the session-records collection so far.
    pub fn transactions_collection_write_count(&self) -> u64 {
        self.transactions_collection_write_count.load(Ordering::Relaxed)
    }
}
