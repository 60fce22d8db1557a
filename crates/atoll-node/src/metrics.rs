//! Prometheus metrics for the peering and recovery core.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Counters and gauges shared by every PG on a node.
#[derive(Debug)]
pub struct NodeMetricSet {
    /// Peering events processed, labeled by event name.
    pub events_processed: IntCounterVec,
    /// Messages sent to peers, labeled by message kind.
    pub messages_sent: IntCounterVec,
    /// Transactions committed on behalf of peering and recovery.
    pub txns_committed: IntCounter,
    /// Store flushes requested while peering.
    pub flushes_requested: IntCounter,
    /// PGs currently marked down by a fatal error.
    pub pgs_down: IntGauge,
    /// Seconds spent processing one peering event under the PG lock.
    pub event_seconds: Histogram,
}

impl NodeMetricSet {
    pub fn new(registry: &Registry) -> Self {
        let events_processed = IntCounterVec::new(
            Opts::new("pg_events_processed_total", "Peering events processed"),
            &["event"],
        )
        .expect("metric definitions are valid");
        let messages_sent = IntCounterVec::new(
            Opts::new("pg_messages_sent_total", "Peer messages sent"),
            &["kind"],
        )
        .expect("metric definitions are valid");
        let txns_committed = IntCounter::new(
            "pg_txns_committed_total",
            "Store transactions committed by peering and recovery",
        )
        .expect("metric definitions are valid");
        let flushes_requested = IntCounter::new(
            "pg_flushes_requested_total",
            "Store flushes requested during peering",
        )
        .expect("metric definitions are valid");
        let pgs_down = IntGauge::new("pgs_down", "PGs marked down by a fatal error")
            .expect("metric definitions are valid");
        let event_seconds = Histogram::with_opts(
            HistogramOpts::new("pg_event_seconds", "Time processing one peering event")
                .buckets(prometheus::exponential_buckets(1e-6, 4.0, 10).expect("valid buckets")),
        )
        .expect("metric definitions are valid");

        for collector in [
            Box::new(events_processed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(messages_sent.clone()),
            Box::new(txns_committed.clone()),
            Box::new(flushes_requested.clone()),
            Box::new(pgs_down.clone()),
            Box::new(event_seconds.clone()),
        ] {
            registry
                .register(collector)
                .expect("metrics register once per registry");
        }

        Self {
            events_processed,
            messages_sent,
            txns_committed,
            flushes_requested,
            pgs_down,
            event_seconds,
        }
    }

    /// A metric set on a private registry, for tests.
    pub fn new_for_test() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new(&Registry::new()))
    }
}
