// src/metrics/collector.rs
use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

pub struct MetricsCollector {
    // Accept loop
    pub connections_accepted_total: IntCounter,
    pub accept_errors_total: IntCounter,

    // Readers
    pub connections_active: IntGauge,
    pub bytes_received_total: IntCounter,
    pub read_errors_total: IntCounter,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let connections_accepted_total = IntCounter::new(
            "drain_connections_accepted_total",
            "Total number of accepted connections",
        )?;
        registry.register(Box::new(connections_accepted_total.clone()))?;

        let accept_errors_total = IntCounter::new(
            "drain_accept_errors_total",
            "Accept failures other than a closed listener",
        )?;
        registry.register(Box::new(accept_errors_total.clone()))?;

        let connections_active =
            IntGauge::new("drain_connections_active", "Connections with a running reader")?;
        registry.register(Box::new(connections_active.clone()))?;

        let bytes_received_total =
            IntCounter::new("drain_bytes_received_total", "Total bytes read from peers")?;
        registry.register(Box::new(bytes_received_total.clone()))?;

        let read_errors_total = IntCounter::new(
            "drain_read_errors_total",
            "Reads that failed with something other than end-of-stream",
        )?;
        registry.register(Box::new(read_errors_total.clone()))?;

        Ok(Self {
            connections_accepted_total,
            accept_errors_total,
            connections_active,
            bytes_received_total,
            read_errors_total,
        })
    }

    pub fn record_accept(&self) {
        self.connections_accepted_total.inc();
    }

    pub fn record_accept_error(&self) {
        self.accept_errors_total.inc();
    }

    pub fn increment_active_connections(&self) {
        self.connections_active.inc();
    }

    pub fn decrement_active_connections(&self) {
        self.connections_active.dec();
    }

    pub fn record_bytes_received(&self, len: usize) {
        self.bytes_received_total.inc_by(len as u64);
    }

    pub fn record_read_error(&self) {
        self.read_errors_total.inc();
    }
}
