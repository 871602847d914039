//! # portrelay
//!
//! A user-space L4 relay: accepts TCP and UDP traffic on rule-defined
//! listener endpoints and forwards it to declared upstream endpoints,
//! surviving transient upstream failures without disturbing downstream
//! clients.
//!
//! ## Features
//!
//! - Rule-driven TCP and UDP forwarding (point-to-point and broadcast)
//! - Per-rule upstream connection pools with automatic reconnection
//! - Bounded in-memory buffering across upstream outages (FIFO, tail-drop)
//! - UDP session tracking with idle eviction
//! - Subscription-based UDP broadcast fan-out with heartbeats
//! - Ordered CIDR allow/deny access control on the accept path
//!
//! ## Architecture
//!
//! The [`engine::ForwardingEngine`] is the administrator surface: it owns
//! all per-rule runtime state and activates or deactivates rules. External
//! concerns reach the core through four narrow contracts: the access
//! policy ([`access::AccessPolicy`]), connection-record persistence
//! ([`sink::ConnectionSink`]), metrics counters ([`sink::MetricsSink`]),
//! and listener status ([`sink::ListenerStatusSink`]). All of them ship
//! with in-memory implementations, so the whole data plane runs and tests
//! without any external system.

pub mod access;
pub mod broadcast;
pub mod config;
pub mod engine;
pub mod pool;
pub mod registry;
pub mod rule;
pub mod sink;
pub mod tcp;
pub mod udp;
