//! Telemetry: structured log sink and Prometheus registry.
//!
//! The sink is the pluggable four-method adapter consumed by the relay
//! core; the default implementation forwards to `tracing` and counts
//! every line in `logs_total{level}`.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde_json::Value;
use std::sync::Arc;
use worldgate_core::{GateError, GateResult};

/// Structured log sink: a message plus a metadata bag per line.
pub trait TelemetrySink: Send + Sync {
    fn info(&self, message: &str, meta: Value);
    fn warn(&self, message: &str, meta: Value);
    fn error(&self, message: &str, meta: Value);
    fn debug(&self, message: &str, meta: Value);
}

/// Process-wide Prometheus metrics.
pub struct Metrics {
    registry: Registry,
    /// Log lines emitted through the sink, by level.
    pub logs_total: IntCounterVec,
    /// Requests relayed to a world (envelope successfully sent).
    pub relayed_total: IntCounter,
    /// Unsolicited world-push frames received.
    pub pushes_total: IntCounter,
    /// Currently registered world sessions.
    pub connected_worlds: IntGauge,
}

impl Metrics {
    pub fn new() -> GateResult<Self> {
        let registry = Registry::new();

        let logs_total = IntCounterVec::new(
            Opts::new("logs_total", "Log lines emitted, by level"),
            &["level"],
        )
        .map_err(prom_err)?;
        let relayed_total = IntCounter::new(
            "worldgate_relayed_requests_total",
            "Requests relayed to a world",
        )
        .map_err(prom_err)?;
        let pushes_total = IntCounter::new(
            "worldgate_world_pushes_total",
            "Unsolicited world-push frames received",
        )
        .map_err(prom_err)?;
        let connected_worlds = IntGauge::new(
            "worldgate_connected_worlds",
            "Currently registered world sessions",
        )
        .map_err(prom_err)?;

        registry
            .register(Box::new(logs_total.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(relayed_total.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(pushes_total.clone()))
            .map_err(prom_err)?;
        registry
            .register(Box::new(connected_worlds.clone()))
            .map_err(prom_err)?;

        #[cfg(target_os = "linux")]
        registry
            .register(Box::new(
                prometheus::process_collector::ProcessCollector::for_self(),
            ))
            .map_err(prom_err)?;

        Ok(Self {
            registry,
            logs_total,
            relayed_total,
            pushes_total,
            connected_worlds,
        })
    }

    /// Text-encode the registry for `GET /metrics`.
    pub fn encode(&self) -> GateResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| GateError::Other(e.to_string()))
    }
}

fn prom_err(e: impl std::fmt::Display) -> GateError {
    GateError::Other(format!("prometheus: {e}"))
}

/// Default sink: `tracing` events plus the `logs_total{level}` counter.
pub struct PrometheusSink {
    logs_total: IntCounterVec,
}

impl PrometheusSink {
    pub fn new(metrics: &Metrics) -> Arc<Self> {
        Arc::new(Self {
            logs_total: metrics.logs_total.clone(),
        })
    }
}

impl TelemetrySink for PrometheusSink {
    fn info(&self, message: &str, meta: Value) {
        self.logs_total.with_label_values(&["info"]).inc();
        tracing::info!(meta = %meta, "{message}");
    }

    fn warn(&self, message: &str, meta: Value) {
        self.logs_total.with_label_values(&["warn"]).inc();
        tracing::warn!(meta = %meta, "{message}");
    }

    fn error(&self, message: &str, meta: Value) {
        self.logs_total.with_label_values(&["error"]).inc();
        tracing::error!(meta = %meta, "{message}");
    }

    fn debug(&self, message: &str, meta: Value) {
        self.logs_total.with_label_values(&["debug"]).inc();
        tracing::debug!(meta = %meta, "{message}");
    }
}
