//! Per-transaction statistics.
//!
//! A [`SingleTransactionStats`] exists only while the session is in
//! multi-statement mode. It accounts wall-clock duration split into
//! active time (attached to an operation) and inactive time (stashed
//! between round trips), and remembers the last client that touched
//! the transaction for currentOp-style reporting.

use serde::Serialize;
use serde_json::Value;
use vellum_core::context::Client;

/// Metrics accumulated across a transaction's statements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdditiveMetrics {
    /// Operations buffered.
    pub operations: u64,
    /// Bytes buffered.
    pub operation_bytes: u64,
}

impl AdditiveMetrics {
    /// Fold `other` into this.
    pub fn add(&mut self, other: &AdditiveMetrics) {
        self.operations += other.operations;
        self.operation_bytes += other.operation_bytes;
    }

    /// Single-line rendering for the slow-transaction log.
    pub fn report(&self) -> String {
        format!("ops:{} opBytes:{}", self.operations, self.operation_bytes)
    }
}

/// Identity of the last client that ran an operation on the session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LastClientInfo {
    /// Remote host and port.
    pub client_host_and_port: String,
    /// Connection id.
    pub connection_id: i64,
    /// Application name from the handshake.
    pub app_name: String,
    /// Driver metadata from the handshake.
    pub client_metadata: Value,
}

impl LastClientInfo {
    /// Refresh from `client`.
    pub fn update(&mut self, client: &Client) {
        self.client_host_and_port = client.host_and_port().to_string();
        self.connection_id = client.connection_id();
        self.app_name = client.app_name().to_string();
        self.client_metadata = client.metadata().clone();
    }
}

/// Timing, activity, and client accounting for one multi-statement
/// transaction.
#[derive(Debug, Clone, Default)]
pub struct SingleTransactionStats {
    start_time_micros: u64,
    end_time_micros: Option<u64>,
    time_active_micros: u64,
    active_since_micros: Option<u64>,
    last_client_info: LastClientInfo,
    additive: AdditiveMetrics,
}

impl SingleTransactionStats {
    /// Stats for a transaction starting now.
    pub fn start(now_micros: u64) -> Self {
        SingleTransactionStats {
            start_time_micros: now_micros,
            ..SingleTransactionStats::default()
        }
    }

    /// When the transaction started.
    pub fn start_time_micros(&self) -> u64 {
        self.start_time_micros
    }

    /// When the transaction terminated, if it has.
    pub fn end_time_micros(&self) -> Option<u64> {
        self.end_time_micros
    }

    /// Record termination.
    pub fn set_end_time(&mut self, now_micros: u64) {
        self.end_time_micros = Some(now_micros);
    }

    /// Whether the transaction is currently attached to an operation.
    pub fn is_active(&self) -> bool {
        self.active_since_micros.is_some()
    }

    /// Mark the transaction active.
    pub fn set_active(&mut self, now_micros: u64) {
        if self.active_since_micros.is_none() {
            self.active_since_micros = Some(now_micros);
        }
    }

    /// Mark the transaction inactive, folding the active interval into
    /// the running total.
    pub fn set_inactive(&mut self, now_micros: u64) {
        if let Some(since) = self.active_since_micros.take() {
            self.time_active_micros += now_micros.saturating_sub(since);
        }
    }

    /// Total open duration as of `now_micros` (or termination).
    pub fn duration_micros(&self, now_micros: u64) -> u64 {
        self.end_time_micros
            .unwrap_or(now_micros)
            .saturating_sub(self.start_time_micros)
    }

    /// Time spent attached to an operation as of `now_micros`.
    pub fn time_active_micros(&self, now_micros: u64) -> u64 {
        let running = self
            .active_since_micros
            .map(|since| now_micros.saturating_sub(since))
            .unwrap_or(0);
        self.time_active_micros + running
    }

    /// Time spent stashed as of `now_micros`.
    pub fn time_inactive_micros(&self, now_micros: u64) -> u64 {
        self.duration_micros(now_micros)
            .saturating_sub(self.time_active_micros(now_micros))
    }

    /// The last client that touched the transaction.
    pub fn last_client_info(&self) -> &LastClientInfo {
        &self.last_client_info
    }

    /// Refresh the last-client identity.
    pub fn update_last_client_info(&mut self, client: &Client) {
        self.last_client_info.update(client);
    }

    /// Accumulated per-statement metrics.
    pub fn additive_metrics(&self) -> &AdditiveMetrics {
        &self.additive
    }

    /// Fold per-statement metrics into the aggregate.
    pub fn add_metrics(&mut self, metrics: &AdditiveMetrics) {
        self.additive.add(metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_time_accumulates_across_intervals() {
        let mut stats = SingleTransactionStats::start(1_000);
        stats.set_active(1_000);
        stats.set_inactive(1_500);
        stats.set_active(2_000);
        stats.set_inactive(2_250);

        assert_eq!(stats.time_active_micros(3_000), 750);
        assert_eq!(stats.duration_micros(3_000), 2_000);
        assert_eq!(stats.time_inactive_micros(3_000), 1_250);
    }

    #[test]
    fn test_running_active_interval_counts() {
        let mut stats = SingleTransactionStats::start(0);
        stats.set_active(100);
        assert!(stats.is_active());
        assert_eq!(stats.time_active_micros(600), 500);
    }

    #[test]
    fn test_duration_freezes_at_end_time() {
        let mut stats = SingleTransactionStats::start(0);
        stats.set_end_time(5_000);
        assert_eq!(stats.duration_micros(9_999), 5_000);
    }

    #[test]
    fn test_set_active_is_idempotent() {
        let mut stats = SingleTransactionStats::start(0);
        stats.set_active(100);
        stats.set_active(400);
        stats.set_inactive(500);
        assert_eq!(stats.time_active_micros(500), 400);
    }

    #[test]
    fn test_additive_metrics_fold() {
        let mut stats = SingleTransactionStats::start(0);
        stats.add_metrics(&AdditiveMetrics {
            operations: 1,
            operation_bytes: 64,
        });
        stats.add_metrics(&AdditiveMetrics {
            operations: 2,
            operation_bytes: 36,
        });
        assert_eq!(stats.additive_metrics().operations, 3);
        assert_eq!(stats.additive_metrics().operation_bytes, 100);
        assert_eq!(stats.additive_metrics().report(), "ops:3 opBytes:100");
    }
}
