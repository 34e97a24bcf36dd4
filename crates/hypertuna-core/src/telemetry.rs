//! Telemetry and revocation observer seams.
//!
//! Components never emit events through ad-hoc callbacks; they talk to these
//! small traits, and the binary decides where the signals go (structured
//! logs, the metrics endpoint, or nowhere in tests).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{info, warn};

/// Sink for operational counters, gauges, and structured events.
pub trait TelemetrySink: Send + Sync {
    /// Add `value` to a named monotonic counter.
    fn incr_counter(&self, name: &'static str, value: u64);

    /// Set a named gauge to an absolute value.
    fn set_gauge(&self, name: &'static str, value: f64);

    /// Emit a structured event (audit trail, scheduling decisions).
    fn event(&self, name: &'static str, fields: &serde_json::Value);
}

/// Listener for escrow revocations; the binary wires this to the lease vault.
pub trait RevocationListener: Send + Sync {
    /// Called once per revoked escrow id observed on the revocation stream.
    fn on_revoked(&self, escrow_id: &str, reason: &str);
}

/// Telemetry sink that forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTelemetry;

impl TelemetrySink for LogTelemetry {
    fn incr_counter(&self, name: &'static str, value: u64) {
        info!(counter = name, value, "telemetry counter");
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        info!(gauge = name, value, "telemetry gauge");
    }

    fn event(&self, name: &'static str, fields: &serde_json::Value) {
        info!(event = name, fields = %fields, "telemetry event");
    }
}

/// Telemetry sink that drops everything. For tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn incr_counter(&self, _name: &'static str, _value: u64) {}
    fn set_gauge(&self, _name: &'static str, _value: f64) {}
    fn event(&self, _name: &'static str, _fields: &serde_json::Value) {}
}

/// In-memory counters/gauges the metrics endpoint scrapes.
///
/// Counters are lock-free atomics keyed by a small fixed registry; gauges
/// and events go through a mutex-guarded map (low write rate).
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: Mutex<HashMap<&'static str, AtomicU64>>,
    gauges: Mutex<HashMap<&'static str, f64>>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` to a named monotonic counter.
    ///
    /// Inherent mirror of the trait method, so callers holding a concrete
    /// registry don't need the trait in scope.
    pub fn incr_counter(&self, name: &'static str, value: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            counters
                .entry(name)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(value, Ordering::Relaxed);
        }
    }

    /// Set a named gauge to an absolute value.
    pub fn set_gauge(&self, name: &'static str, value: f64) {
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.insert(name, value);
        }
    }

    /// Emit a structured event.
    pub fn event(&self, name: &'static str, fields: &serde_json::Value) {
        info!(event = name, fields = %fields, "gateway event");
    }

    /// Snapshot all counters as `(name, value)` pairs sorted by name.
    pub fn counters(&self) -> Vec<(&'static str, u64)> {
        let Ok(counters) = self.counters.lock() else {
            warn!("metrics counters mutex poisoned");
            return Vec::new();
        };
        let mut out: Vec<(&'static str, u64)> = counters
            .iter()
            .map(|(k, v)| (*k, v.load(Ordering::Relaxed)))
            .collect();
        out.sort_by_key(|(k, _)| *k);
        out
    }

    /// Snapshot all gauges as `(name, value)` pairs sorted by name.
    pub fn gauges(&self) -> Vec<(&'static str, f64)> {
        let Ok(gauges) = self.gauges.lock() else {
            warn!("metrics gauges mutex poisoned");
            return Vec::new();
        };
        let mut out: Vec<(&'static str, f64)> = gauges.iter().map(|(k, v)| (*k, *v)).collect();
        out.sort_by_key(|(k, _)| *k);
        out
    }
}

impl TelemetrySink for MetricsRegistry {
    fn incr_counter(&self, name: &'static str, value: u64) {
        Self::incr_counter(self, name, value);
    }

    fn set_gauge(&self, name: &'static str, value: f64) {
        Self::set_gauge(self, name, value);
    }

    fn event(&self, name: &'static str, fields: &serde_json::Value) {
        Self::event(self, name, fields);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let registry = MetricsRegistry::new();
        registry.incr_counter("jobs_assigned", 1);
        registry.incr_counter("jobs_assigned", 2);
        registry.incr_counter("jobs_failed", 1);
        let counters = registry.counters();
        assert_eq!(counters, vec![("jobs_assigned", 3), ("jobs_failed", 1)]);
    }

    #[test]
    fn gauges_overwrite() {
        let registry = MetricsRegistry::new();
        registry.set_gauge("peers_live", 3.0);
        registry.set_gauge("peers_live", 5.0);
        assert_eq!(registry.gauges(), vec![("peers_live", 5.0)]);
    }
}
