//! # Upstream Connection Pool
//!
//! A fixed vector of outbound TCP slots per forwarding rule. The first slot
//! is dialled eagerly so the upstream can push unsolicited data; the rest
//! fill on demand. Each slot runs its own reconnect state machine with
//! linear backoff capped at 60 s, and every live connection carries a reader
//! task that routes upstream bytes back into the client registry.

mod conn;
mod error;
mod upstream;

pub use conn::UpstreamConn;
pub use error::{PoolError, PoolResult};
pub use upstream::{PoolState, PoolStatus, SlotState, UpstreamPool};
