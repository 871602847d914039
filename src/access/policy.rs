//! Access rules and the policy store contract.

use std::net::Ipv4Addr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::cidr::Cidr;
use super::error::AccessResult;

/// Verdict attached to an access rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessAction {
    /// Matching clients are admitted.
    Allow,
    /// Matching clients are rejected.
    Deny,
}

impl AccessAction {
    /// Whether this action admits traffic.
    #[must_use]
    pub fn is_allow(self) -> bool {
        matches!(self, AccessAction::Allow)
    }
}

/// One allow/deny entry. A `rule_id` of `None` makes the entry global; the
/// effective set for a forwarding rule is the union of global and rule-scoped
/// entries, ordered by ascending priority (lower number wins).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    /// Store-assigned identifier.
    pub id: i64,

    /// Forwarding rule this entry is scoped to; `None` for global.
    pub rule_id: Option<i64>,

    /// The network this entry matches. Parsed at construction, so the
    /// accept path never sees a malformed CIDR.
    pub cidr: Cidr,

    /// Allow or deny.
    pub action: AccessAction,

    /// Evaluation order; lower values are consulted first.
    pub priority: i32,

    /// Disabled entries are skipped.
    pub enabled: bool,
}

impl AccessRule {
    /// Create a global entry.
    #[must_use]
    pub fn global(id: i64, cidr: Cidr, action: AccessAction, priority: i32) -> Self {
        Self {
            id,
            rule_id: None,
            cidr,
            action,
            priority,
            enabled: true,
        }
    }

    /// Create an entry scoped to one forwarding rule.
    #[must_use]
    pub fn for_rule(id: i64, rule_id: i64, cidr: Cidr, action: AccessAction, priority: i32) -> Self {
        Self {
            rule_id: Some(rule_id),
            ..Self::global(id, cidr, action, priority)
        }
    }

    /// Whether this entry applies to the given forwarding rule.
    #[must_use]
    pub fn applies_to(&self, rule_id: i64) -> bool {
        self.rule_id.is_none() || self.rule_id == Some(rule_id)
    }

    /// Whether an enabled entry matches the client address.
    #[must_use]
    pub fn matches(&self, ip: Ipv4Addr) -> bool {
        self.enabled && self.cidr.contains(ip)
    }
}

/// Access policy store consumed by the decider.
///
/// The returned list is a snapshot ordered by ascending priority; the core
/// does not retain it between decisions.
pub trait AccessPolicy: Send + Sync {
    /// Effective rule set (global plus rule-scoped) for a forwarding rule.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unavailable; the decider treats
    /// that as fail-open.
    fn effective_rules(&self, rule_id: i64) -> AccessResult<Vec<AccessRule>>;
}

/// In-memory policy store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAccessPolicy {
    rules: RwLock<Vec<AccessRule>>,
}

impl MemoryAccessPolicy {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry.
    pub fn add(&self, rule: AccessRule) {
        self.rules.write().expect("rules lock poisoned").push(rule);
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.rules.write().expect("rules lock poisoned").clear();
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.read().expect("rules lock poisoned").len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AccessPolicy for MemoryAccessPolicy {
    fn effective_rules(&self, rule_id: i64) -> AccessResult<Vec<AccessRule>> {
        let rules = self.rules.read().expect("rules lock poisoned");
        let mut effective: Vec<AccessRule> = rules
            .iter()
            .filter(|r| r.applies_to(rule_id))
            .cloned()
            .collect();
        effective.sort_by_key(|r| r.priority);
        Ok(effective)
    }
}
