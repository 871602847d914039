//! # Forwarding Engine
//!
//! Rule lifecycle orchestration: decides per protocol which servers to run
//! (TCP pipeline, UDP point-to-point, UDP broadcast), owns the per-rule
//! upstream pools, and indexes active servers by bind key so two enabled
//! rules can never hold the same listener endpoint.

mod error;
mod forwarding;

pub use error::{EngineError, EngineResult};
pub use forwarding::{ForwardingEngine, RuleState};
