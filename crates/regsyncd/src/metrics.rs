//! Prometheus metrics collection for regsyncd
//!
//! Counts reconciliation activity and exposes it through the status
//! server's /metrics endpoint.

use prometheus::{Counter, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics collector for regsyncd
#[derive(Clone)]
pub struct MetricsCollector {
    events_processed: Counter,
    events_discarded: Counter,
    registers: Counter,
    register_failures: Counter,
    unregisters: Counter,
    unregister_failures: Counter,
    reconnects: Counter,
    resyncs: Counter,

    ledger_size: Gauge,
    channel_connected: Gauge,

    registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_processed = Counter::new(
            "regsyncd_events_processed_total",
            "Total presence events that produced a classification",
        )?;
        registry.register(Box::new(events_processed.clone()))?;

        let events_discarded = Counter::new(
            "regsyncd_events_discarded_total",
            "Total events dropped by ingestion or the scope filter",
        )?;
        registry.register(Box::new(events_discarded.clone()))?;

        let registers = Counter::new(
            "regsyncd_registers_total",
            "Total register actions issued to the remote peer",
        )?;
        registry.register(Box::new(registers.clone()))?;

        let register_failures = Counter::new(
            "regsyncd_register_failures_total",
            "Total register actions that failed",
        )?;
        registry.register(Box::new(register_failures.clone()))?;

        let unregisters = Counter::new(
            "regsyncd_unregisters_total",
            "Total unregister actions issued to the remote peer",
        )?;
        registry.register(Box::new(unregisters.clone()))?;

        let unregister_failures = Counter::new(
            "regsyncd_unregister_failures_total",
            "Total unregister actions that failed (ledger entry dropped anyway)",
        )?;
        registry.register(Box::new(unregister_failures.clone()))?;

        let reconnects = Counter::new(
            "regsyncd_reconnects_total",
            "Total management channel reconnect attempts",
        )?;
        registry.register(Box::new(reconnects.clone()))?;

        let resyncs = Counter::new(
            "regsyncd_resyncs_total",
            "Total forced full resync passes",
        )?;
        registry.register(Box::new(resyncs.clone()))?;

        let ledger_size = Gauge::new(
            "regsyncd_ledger_size",
            "DNs currently believed registered with the remote peer",
        )?;
        registry.register(Box::new(ledger_size.clone()))?;

        let channel_connected = Gauge::new(
            "regsyncd_channel_connected",
            "Management channel status (1=connected, 0=disconnected)",
        )?;
        registry.register(Box::new(channel_connected.clone()))?;

        Ok(Self {
            events_processed,
            events_discarded,
            registers,
            register_failures,
            unregisters,
            unregister_failures,
            reconnects,
            resyncs,
            ledger_size,
            channel_connected,
            registry: Arc::new(registry),
        })
    }

    /// Record a classified presence event.
    pub fn record_event(&self) {
        self.events_processed.inc();
    }

    /// Record an event dropped before reconciliation.
    pub fn record_event_discarded(&self) {
        self.events_discarded.inc();
    }

    /// Record a register attempt and its outcome.
    pub fn record_register(&self, ok: bool) {
        self.registers.inc();
        if !ok {
            self.register_failures.inc();
        }
    }

    /// Record an unregister attempt and its outcome.
    pub fn record_unregister(&self, ok: bool) {
        self.unregisters.inc();
        if !ok {
            self.unregister_failures.inc();
        }
    }

    /// Record a reconnect attempt.
    pub fn record_reconnect(&self) {
        self.reconnects.inc();
    }

    /// Record a forced resync pass.
    pub fn record_resync(&self) {
        self.resyncs.inc();
    }

    /// Set the ledger size gauge.
    pub fn set_ledger_size(&self, size: usize) {
        self.ledger_size.set(size as f64);
    }

    /// Set the channel connection status gauge.
    pub fn set_channel_connected(&self, connected: bool) {
        self.channel_connected.set(if connected { 1.0 } else { 0.0 });
    }

    /// Gather metrics in Prometheus text format.
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = vec![];
        encoder.encode(&self.registry.gather(), &mut buf).ok();
        String::from_utf8(buf).unwrap_or_else(|_| String::from("# Error encoding metrics\n"))
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics collector")
    }
}
