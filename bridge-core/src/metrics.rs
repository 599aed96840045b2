//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the relay.
//!
//! # Metrics
//!
//! - `bridge_transfers_observed_total` - Transfers recorded by the observers
//! - `bridge_events_rejected_total` - Source events dropped by validation
//! - `bridge_transfers_completed_total` - Transfers settled on the destination
//! - `bridge_transfers_failed_total` - Transfers marked failed
//! - `bridge_roots_registered_total` - Roots registered on a destination
//! - `bridge_remote_retries_total` - Retried remote ledger calls
//! - `bridge_settlement_duration_seconds` - Time from proof to settlement

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
///
/// Each instance owns its registry, so several relays (or tests) can run in
/// one process.
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Transfers recorded
    pub transfers_observed: IntCounter,

    /// Events rejected by the observer
    pub events_rejected: IntCounter,

    /// Transfers completed
    pub transfers_completed: IntCounter,

    /// Transfers failed
    pub transfers_failed: IntCounter,

    /// Roots registered
    pub roots_registered: IntCounter,

    /// Remote call retries
    pub remote_retries: IntCounter,

    /// Settlement duration histogram
    pub settlement_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let transfers_observed = counter(
            "bridge_transfers_observed_total",
            "Transfers recorded by the observers",
        )?;
        let events_rejected = counter(
            "bridge_events_rejected_total",
            "Source events dropped by validation",
        )?;
        let transfers_completed = counter(
            "bridge_transfers_completed_total",
            "Transfers settled on the destination",
        )?;
        let transfers_failed = counter("bridge_transfers_failed_total", "Transfers marked failed")?;
        let roots_registered = counter(
            "bridge_roots_registered_total",
            "Roots registered on a destination ledger",
        )?;
        let remote_retries = counter("bridge_remote_retries_total", "Retried remote ledger calls")?;

        let settlement_duration = Histogram::with_opts(
            HistogramOpts::new(
                "bridge_settlement_duration_seconds",
                "Time from proof to settlement",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        registry.register(Box::new(settlement_duration.clone()))?;

        Ok(Self {
            transfers_observed,
            events_rejected,
            transfers_completed,
            transfers_failed,
            roots_registered,
            remote_retries,
            settlement_duration,
            registry,
        })
    }

    /// Record an observed transfer
    pub fn record_observed(&self) {
        self.transfers_observed.inc();
    }

    /// Record a rejected source event
    pub fn record_rejected_event(&self) {
        self.events_rejected.inc();
    }

    /// Record a completed settlement and its duration
    pub fn record_completed(&self, duration_seconds: f64) {
        self.transfers_completed.inc();
        self.settlement_duration.observe(duration_seconds);
    }

    /// Record a failed transfer
    pub fn record_failed(&self) {
        self.transfers_failed.inc();
    }

    /// Record a root registration
    pub fn record_root_registered(&self) {
        self.roots_registered.inc();
    }

    /// Record a retried remote call
    pub fn record_retry(&self) {
        self.remote_retries.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
