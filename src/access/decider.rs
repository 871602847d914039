//! The hot-path access decision.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::policy::AccessPolicy;

/// Decides whether a client IP may use a forwarding rule.
///
/// The walk is first-match-wins over the effective rule set in ascending
/// priority order. When no rule matches, the verdict depends on the set's
/// composition: any ALLOW rule present means unmatched clients are denied
/// (whitelisting in use); a set of only DENY rules admits unmatched clients.
/// An empty set admits everyone.
///
/// Policy lookup failures fail open: denying all traffic because the policy
/// store is down would turn a store outage into a relay outage.
pub struct AccessDecider {
    policy: Arc<dyn AccessPolicy>,
    fail_open: AtomicU64,
}

impl AccessDecider {
    /// Create a decider over a policy store.
    #[must_use]
    pub fn new(policy: Arc<dyn AccessPolicy>) -> Self {
        Self {
            policy,
            fail_open: AtomicU64::new(0),
        }
    }

    /// Whether `client_ip` is allowed to use forwarding rule `rule_id`.
    #[must_use]
    pub fn allowed(&self, client_ip: IpAddr, rule_id: i64) -> bool {
        let rules = match self.policy.effective_rules(rule_id) {
            Ok(rules) => rules,
            Err(e) => {
                self.fail_open.fetch_add(1, Ordering::Relaxed);
                warn!(
                    client = %client_ip,
                    rule = rule_id,
                    error = %e,
                    "access rule lookup failed, failing open"
                );
                return true;
            }
        };

        if rules.is_empty() {
            return true;
        }

        // Only IPv4 rules exist; an IPv6 client can match solely via a
        // v4-mapped address.
        let v4 = match client_ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(v6) => v6.to_ipv4_mapped(),
        };

        if let Some(ip) = v4 {
            for rule in rules.iter().filter(|r| r.enabled) {
                if rule.matches(ip) {
                    let allowed = rule.action.is_allow();
                    debug!(
                        client = %client_ip,
                        rule = rule_id,
                        matched = %rule.cidr,
                        allowed,
                        "access rule matched"
                    );
                    return allowed;
                }
            }
        }

        let has_allow = rules.iter().any(|r| r.enabled && r.action.is_allow());
        if has_allow {
            debug!(
                client = %client_ip,
                rule = rule_id,
                "no match with allow rules present, denying"
            );
            false
        } else {
            true
        }
    }

    /// Number of decisions that failed open due to lookup errors.
    #[must_use]
    pub fn fail_open_count(&self) -> u64 {
        self.fail_open.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessAction, AccessError, AccessResult, AccessRule, Cidr, MemoryAccessPolicy};

    struct FailingPolicy;

    impl AccessPolicy for FailingPolicy {
        fn effective_rules(&self, _rule_id: i64) -> AccessResult<Vec<AccessRule>> {
            Err(AccessError::LookupFailed("store offline".to_string()))
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn cidr(s: &str) -> Cidr {
        Cidr::parse(s).unwrap()
    }

    #[test]
    fn test_empty_policy_allows() {
        let decider = AccessDecider::new(Arc::new(MemoryAccessPolicy::new()));
        assert!(decider.allowed(ip("10.1.2.3"), 1));
    }

    #[test]
    fn test_first_match_wins() {
        let policy = MemoryAccessPolicy::new();
        policy.add(AccessRule::global(1, cidr("10.1.0.0/16"), AccessAction::Allow, 1));
        policy.add(AccessRule::global(2, cidr("10.0.0.0/8"), AccessAction::Deny, 2));
        let decider = AccessDecider::new(Arc::new(policy));

        // 10.1.x.x hits the higher-priority allow first.
        assert!(decider.allowed(ip("10.1.2.3"), 1));
        // The rest of 10/8 falls through to the deny.
        assert!(!decider.allowed(ip("10.2.3.4"), 1));
    }

    #[test]
    fn test_blacklist_only_admits_unmatched() {
        let policy = MemoryAccessPolicy::new();
        policy.add(AccessRule::global(1, cidr("10.0.0.0/8"), AccessAction::Deny, 1));
        let decider = AccessDecider::new(Arc::new(policy));

        assert!(!decider.allowed(ip("10.1.2.3"), 1));
        assert!(decider.allowed(ip("192.168.1.1"), 1));
    }

    #[test]
    fn test_whitelist_denies_unmatched() {
        let policy = MemoryAccessPolicy::new();
        policy.add(AccessRule::global(1, cidr("192.168.0.0/16"), AccessAction::Allow, 1));
        let decider = AccessDecider::new(Arc::new(policy));

        assert!(decider.allowed(ip("192.168.1.1"), 1));
        assert!(!decider.allowed(ip("10.1.2.3"), 1));
    }

    #[test]
    fn test_disabled_allow_does_not_flip_default() {
        let policy = MemoryAccessPolicy::new();
        let mut allow = AccessRule::global(1, cidr("192.168.0.0/16"), AccessAction::Allow, 1);
        allow.enabled = false;
        policy.add(allow);
        policy.add(AccessRule::global(2, cidr("10.0.0.0/8"), AccessAction::Deny, 2));
        let decider = AccessDecider::new(Arc::new(policy));

        // Only the deny rule is live, so unmatched clients pass.
        assert!(decider.allowed(ip("172.16.0.1"), 1));
    }

    #[test]
    fn test_lookup_failure_fails_open() {
        let decider = AccessDecider::new(Arc::new(FailingPolicy));
        assert!(decider.allowed(ip("10.1.2.3"), 1));
        assert_eq!(decider.fail_open_count(), 1);
        assert!(decider.allowed(ip("10.1.2.4"), 1));
        assert_eq!(decider.fail_open_count(), 2);
    }

    #[test]
    fn test_ipv6_client_with_whitelist_denied() {
        let policy = MemoryAccessPolicy::new();
        policy.add(AccessRule::global(1, cidr("192.168.0.0/16"), AccessAction::Allow, 1));
        let decider = AccessDecider::new(Arc::new(policy));

        assert!(!decider.allowed(ip("::1"), 1));
        // A v4-mapped address still matches IPv4 rules.
        assert!(decider.allowed(ip("::ffff:192.168.1.1"), 1));
    }
}
