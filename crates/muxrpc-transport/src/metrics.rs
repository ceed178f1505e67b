//! Channel-level metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of channel metrics at a point in time.
pub struct MetricsSnapshot {
    /// Logical requests started through [`crate::RetryingRequest`].
    pub calls_sent: u64,
    /// Attempts dispatched to a peer, including retries.
    pub attempts: u64,
    /// Attempts that were retries of an earlier one.
    pub retries: u64,
    /// Outbound operations that timed out.
    pub timeouts: u64,
    /// Inbound calls handed to a handler.
    pub requests_received: u64,
    /// Responses and error frames written for inbound calls.
    pub responses_sent: u64,
    /// Connections created.
    pub connections_opened: u64,
    /// Connections torn down for any reason.
    pub connections_closed: u64,
    /// Connections torn down because of a failure rather than a local close.
    pub connection_resets: u64,
    /// Inbound calls answered Busy by the rate limiter.
    pub rate_limited: u64,
    /// Inbound calls forwarded by a relay.
    pub relayed: u64,
}

/// Thread-safe channel metrics collector.
#[derive(Default)]
pub struct ChannelMetrics {
    calls_sent: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    connection_resets: AtomicU64,
    rate_limited: AtomicU64,
    relayed: AtomicU64,
}

impl std::fmt::Debug for ChannelMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ChannelMetrics {
    /// Creates a collector with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a logical request.
    pub fn inc_calls_sent(&self) {
        self.calls_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a dispatched attempt.
    pub fn inc_attempts(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a retry.
    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an outbound timeout.
    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an inbound call.
    pub fn inc_requests_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an answer to an inbound call.
    pub fn inc_responses_sent(&self) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a new connection.
    pub fn inc_connections_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a torn down connection; `failed` marks resets caused by errors.
    pub fn connection_closed(&self, failed: bool) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.connection_resets.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counts a call rejected by admission control.
    pub fn inc_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a relayed call.
    pub fn inc_relayed(&self) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of connections currently open.
    pub fn active_connections(&self) -> u64 {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        opened.saturating_sub(self.connections_closed.load(Ordering::Relaxed))
    }

    /// Takes a snapshot of all current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            calls_sent: self.calls_sent.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connection_resets: self.connection_resets.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::task::JoinSet;

    #[test]
    fn test_metrics_new() {
        let metrics = ChannelMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
        assert_eq!(metrics.active_connections(), 0);
    }

    #[test]
    fn test_inc_counters() {
        let metrics = ChannelMetrics::new();

        metrics.inc_calls_sent();
        metrics.inc_attempts();
        metrics.inc_attempts();
        metrics.inc_retries();
        metrics.inc_timeouts();
        metrics.inc_requests_received();
        metrics.inc_responses_sent();
        metrics.inc_rate_limited();
        metrics.inc_relayed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.calls_sent, 1);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.requests_received, 1);
        assert_eq!(snapshot.responses_sent, 1);
        assert_eq!(snapshot.rate_limited, 1);
        assert_eq!(snapshot.relayed, 1);
    }

    #[test]
    fn test_connection_tracking() {
        let metrics = ChannelMetrics::new();

        metrics.inc_connections_opened();
        metrics.inc_connections_opened();
        metrics.inc_connections_opened();
        metrics.connection_closed(false);
        metrics.connection_closed(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_opened, 3);
        assert_eq!(snapshot.connections_closed, 2);
        assert_eq!(snapshot.connection_resets, 1);
        assert_eq!(metrics.active_connections(), 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ChannelMetrics::new();
        metrics.inc_calls_sent();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["calls_sent"], 1);
        assert_eq!(json["relayed"], 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments() {
        let metrics = Arc::new(ChannelMetrics::new());
        let mut set = JoinSet::new();
        for _ in 0..8 {
            let metrics = Arc::clone(&metrics);
            set.spawn(async move {
                for _ in 0..100 {
                    metrics.inc_attempts();
                }
            });
        }
        while set.join_next().await.is_some() {}
        assert_eq!(metrics.snapshot().attempts, 800);
    }
}
