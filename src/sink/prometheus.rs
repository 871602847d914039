//! Prometheus-backed metrics sink.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use super::metrics::MetricsSink;

/// [`MetricsSink`] implementation exporting Prometheus text format.
///
/// Counter/gauge handles are cheap clones over shared atomics; the registry
/// only participates when encoding.
pub struct PrometheusMetrics {
    registry: Registry,
    active_connections: Gauge,
    total_connections: Counter,
    connection_errors: Counter,
    transfer_errors: Counter,
    bytes_transferred: Counter,
    forwarding_rules: Gauge,
}

impl PrometheusMetrics {
    /// Create a sink with all relay metrics registered under the
    /// `portrelay` prefix.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("portrelay");

        let active_connections = Gauge::default();
        registry.register(
            "active_connections",
            "Currently active relayed connections",
            active_connections.clone(),
        );

        let total_connections = Counter::default();
        registry.register(
            "connections",
            "Connections established since start",
            total_connections.clone(),
        );

        let connection_errors = Counter::default();
        registry.register(
            "connection_errors",
            "Rejected or failed connection attempts",
            connection_errors.clone(),
        );

        let transfer_errors = Counter::default();
        registry.register(
            "transfer_errors",
            "Failed payload transfers",
            transfer_errors.clone(),
        );

        let bytes_transferred = Counter::default();
        registry.register(
            "bytes_transferred",
            "Payload bytes moved through the relay",
            bytes_transferred.clone(),
        );

        let forwarding_rules = Gauge::default();
        registry.register(
            "forwarding_rules",
            "Currently active forwarding rules",
            forwarding_rules.clone(),
        );

        Self {
            registry,
            active_connections,
            total_connections,
            connection_errors,
            transfer_errors,
            bytes_transferred,
            forwarding_rules,
        }
    }

    /// Encode every metric in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails (formatting only).
    pub fn encode_text(&self) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        encode(&mut out, &self.registry)?;
        Ok(out)
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn inc_active_connections(&self) {
        self.active_connections.inc();
    }

    fn dec_active_connections(&self) {
        self.active_connections.dec();
    }

    fn inc_total_connections(&self) {
        self.total_connections.inc();
    }

    fn inc_connection_errors(&self) {
        self.connection_errors.inc();
    }

    fn inc_transfer_errors(&self) {
        self.transfer_errors.inc();
    }

    fn add_bytes_transferred(&self, bytes: u64) {
        self.bytes_transferred.inc_by(bytes);
    }

    fn inc_forwarding_rules(&self) {
        self.forwarding_rules.inc();
    }

    fn dec_forwarding_rules(&self) {
        self.forwarding_rules.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_encoding() {
        let metrics = PrometheusMetrics::new();
        metrics.inc_total_connections();
        metrics.inc_active_connections();
        metrics.add_bytes_transferred(512);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("portrelay_connections_total 1"));
        assert!(text.contains("portrelay_active_connections 1"));
        assert!(text.contains("portrelay_bytes_transferred_total 512"));
    }

    #[test]
    fn test_gauge_goes_down() {
        let metrics = PrometheusMetrics::new();
        metrics.inc_active_connections();
        metrics.inc_active_connections();
        metrics.dec_active_connections();

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("portrelay_active_connections 1"));
    }
}
