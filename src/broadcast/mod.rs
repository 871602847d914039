//! # UDP Broadcast Relay
//!
//! One-to-many UDP forwarding. Two sockets per rule: the downstream socket
//! (on the rule's source port) runs the text control protocol and accepts
//! downstream-originated data; the upstream socket (on the target port)
//! receives data to fan out. Fan-out is unicast per subscriber.
//!
//! Control protocol, exact ASCII literals: `SUBSCRIBE` -> `SUBSCRIBED`,
//! `UNSUBSCRIBE` -> `UNSUBSCRIBED`, `HEARTBEAT` -> `HEARTBEAT_ACK`; any
//! other payload auto-subscribes new clients (`AUTO_SUBSCRIBED`) and is
//! forwarded to every registered upstream sender.

mod client;
mod error;
mod relay;

pub use client::{BroadcastClient, BroadcastStats};
pub use error::{BroadcastError, BroadcastResult};
pub use relay::BroadcastRelay;
