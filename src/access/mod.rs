//! # IP Access Control
//!
//! Ordered allow/deny CIDR rules evaluated on the accept path. The decision
//! walk is first-match-wins over the effective rule set (global rules plus
//! rules scoped to the forwarding rule, ascending priority); when nothing
//! matches, the presence of any ALLOW rule flips the default to deny
//! (whitelist semantics), otherwise traffic is allowed (blacklist-only
//! semantics). Policy lookup failures fail open.

mod cidr;
mod decider;
mod error;
mod policy;

pub use cidr::Cidr;
pub use decider::AccessDecider;
pub use error::{AccessError, AccessResult};
pub use policy::{AccessAction, AccessPolicy, AccessRule, MemoryAccessPolicy};
