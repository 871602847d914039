//! # Collaborator Sinks
//!
//! The four narrow contracts the data plane consumes: connection-record
//! persistence, metrics counters, listener status, and (in [`crate::access`])
//! the access policy store. Every call is fire-and-forget from the core's
//! perspective; the data path never awaits a sink.
//!
//! In-memory implementations are provided so the core is instantiable and
//! testable without any external system, plus a Prometheus-backed metrics
//! sink for deployments that scrape.

mod connection;
mod listener;
mod metrics;
mod prometheus;
mod record;

pub use connection::{ConnectionSink, MemoryConnectionSink};
pub use listener::{ListenerState, ListenerStatus, ListenerStatusSink, MemoryListenerStatus};
pub use metrics::{AtomicMetrics, MetricsSink, MetricsSnapshot};
pub use prometheus::PrometheusMetrics;
pub use record::{ConnectionRecord, ConnectionStatus};
