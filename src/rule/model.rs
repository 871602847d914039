//! Forwarding rule definition and bind-key derivation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{RuleError, RuleResult};

/// Transport protocol covered by a rule.
///
/// `TcpUdp` is treated as both TCP and UDP for endpoint-conflict detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// TCP only.
    Tcp,
    /// UDP only.
    Udp,
    /// Both TCP and UDP on the same listener endpoint.
    TcpUdp,
}

impl Protocol {
    /// Whether this protocol includes a TCP listener.
    #[must_use]
    pub fn has_tcp(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::TcpUdp)
    }

    /// Whether this protocol includes a UDP listener.
    #[must_use]
    pub fn has_udp(self) -> bool {
        matches!(self, Protocol::Udp | Protocol::TcpUdp)
    }

    /// Whether two protocols contend for the same listener sockets.
    #[must_use]
    pub fn overlaps(self, other: Protocol) -> bool {
        (self.has_tcp() && other.has_tcp()) || (self.has_udp() && other.has_udp())
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::TcpUdp => write!(f, "TCP_UDP"),
        }
    }
}

/// A forwarding rule.
///
/// Identity is the store-assigned `id`. The semantic fields describe one
/// listener endpoint and one upstream endpoint; reconnect fields tune the
/// upstream pool for this rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardRule {
    /// Store-assigned identifier.
    pub id: i64,

    /// Unique human label.
    pub name: String,

    /// Listener address; `None` binds all interfaces.
    pub source_ip: Option<IpAddr>,

    /// Listener port.
    pub source_port: u16,

    /// Upstream address.
    pub target_ip: IpAddr,

    /// Upstream port.
    pub target_port: u16,

    /// Transport protocol(s) to forward.
    pub protocol: Protocol,

    /// Whether the rule is eligible for activation.
    pub enabled: bool,

    /// Whether closed upstream connections are redialled automatically.
    pub auto_reconnect: bool,

    /// Base reconnect delay in milliseconds; the effective delay grows
    /// linearly with the attempt count, capped at 60 s.
    pub reconnect_interval_ms: u64,

    /// Reconnect attempts per slot before giving up.
    pub max_reconnect_attempts: u32,

    /// Number of upstream connection slots.
    pub pool_size: usize,
}

impl Default for ForwardRule {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            source_ip: None,
            source_port: 0,
            target_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            target_port: 0,
            protocol: Protocol::Tcp,
            enabled: true,
            auto_reconnect: true,
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 10,
            pool_size: 1,
        }
    }
}

impl ForwardRule {
    /// Create a rule with default reconnect behaviour.
    #[must_use]
    pub fn new(
        id: i64,
        name: &str,
        source_port: u16,
        target_ip: IpAddr,
        target_port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            source_port,
            target_ip,
            target_port,
            protocol,
            ..Self::default()
        }
    }

    /// Set the listener address.
    #[must_use]
    pub fn with_source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    /// Set the pool size.
    #[must_use]
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the reconnect interval and attempt cap.
    #[must_use]
    pub fn with_reconnect(mut self, interval_ms: u64, max_attempts: u32) -> Self {
        self.reconnect_interval_ms = interval_ms;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    /// The address this rule listens on; an absent source IP binds all
    /// interfaces.
    #[must_use]
    pub fn effective_source_ip(&self) -> IpAddr {
        self.source_ip
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Listener socket address.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.effective_source_ip(), self.source_port)
    }

    /// Upstream socket address.
    #[must_use]
    pub fn target_addr(&self) -> SocketAddr {
        SocketAddr::new(self.target_ip, self.target_port)
    }

    /// Bind key identifying the listener endpoint: `"{sourceIp}_{sourcePort}"`.
    ///
    /// Active servers are indexed by this key plus a protocol suffix, which
    /// is what enforces listener-endpoint uniqueness across enabled rules.
    #[must_use]
    pub fn rule_key(&self) -> String {
        format!("{}_{}", self.effective_source_ip(), self.source_port)
    }

    /// Base reconnect delay.
    #[must_use]
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Validate the transport-defining fields.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint; a rule failing validation must
    /// not be activated.
    pub fn validate(&self) -> RuleResult<()> {
        if self.name.trim().is_empty() {
            return Err(RuleError::EmptyName);
        }
        if self.source_port == 0 {
            return Err(RuleError::InvalidSourcePort(self.source_port));
        }
        if self.target_port == 0 {
            return Err(RuleError::InvalidTargetPort(self.target_port));
        }
        if self.pool_size == 0 {
            return Err(RuleError::InvalidPoolSize);
        }
        Ok(())
    }

    /// Whether this rule and `other` cannot both be active: both enabled,
    /// same listener endpoint, overlapping protocols.
    #[must_use]
    pub fn conflicts_with(&self, other: &ForwardRule) -> bool {
        self.id != other.id
            && self.enabled
            && other.enabled
            && self.effective_source_ip() == other.effective_source_ip()
            && self.source_port == other.source_port
            && self.protocol.overlaps(other.protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, port: u16, protocol: Protocol) -> ForwardRule {
        ForwardRule::new(
            id,
            &format!("rule-{id}"),
            port,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            7000,
            protocol,
        )
    }

    #[test]
    fn test_protocol_overlap() {
        assert!(Protocol::Tcp.overlaps(Protocol::Tcp));
        assert!(!Protocol::Tcp.overlaps(Protocol::Udp));
        assert!(Protocol::TcpUdp.overlaps(Protocol::Tcp));
        assert!(Protocol::TcpUdp.overlaps(Protocol::Udp));
        assert!(Protocol::Udp.overlaps(Protocol::TcpUdp));
    }

    #[test]
    fn test_rule_key_defaults_to_wildcard() {
        let r = rule(1, 9000, Protocol::Tcp);
        assert_eq!(r.rule_key(), "0.0.0.0_9000");

        let r = r.with_source_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(r.rule_key(), "127.0.0.1_9000");
    }

    #[test]
    fn test_validate() {
        assert!(rule(1, 9000, Protocol::Tcp).validate().is_ok());

        let mut bad = rule(1, 0, Protocol::Tcp);
        assert_eq!(bad.validate(), Err(RuleError::InvalidSourcePort(0)));

        bad = rule(1, 9000, Protocol::Tcp);
        bad.name = "  ".to_string();
        assert_eq!(bad.validate(), Err(RuleError::EmptyName));

        bad = rule(1, 9000, Protocol::Tcp);
        bad.target_port = 0;
        assert_eq!(bad.validate(), Err(RuleError::InvalidTargetPort(0)));

        bad = rule(1, 9000, Protocol::Tcp);
        bad.pool_size = 0;
        assert_eq!(bad.validate(), Err(RuleError::InvalidPoolSize));
    }

    #[test]
    fn test_conflict_detection() {
        let a = rule(1, 9000, Protocol::Tcp);
        let b = rule(2, 9000, Protocol::Tcp);
        let c = rule(3, 9000, Protocol::Udp);
        let d = rule(4, 9001, Protocol::Tcp);
        let e = rule(5, 9000, Protocol::TcpUdp);

        assert!(a.conflicts_with(&b));
        assert!(!a.conflicts_with(&c)); // disjoint protocols
        assert!(!a.conflicts_with(&d)); // different port
        assert!(a.conflicts_with(&e)); // TCP_UDP counts as TCP
        assert!(c.conflicts_with(&e)); // and as UDP

        let mut disabled = rule(6, 9000, Protocol::Tcp);
        disabled.enabled = false;
        assert!(!a.conflicts_with(&disabled));
    }

    #[test]
    fn test_rule_never_conflicts_with_itself() {
        let a = rule(1, 9000, Protocol::Tcp);
        assert!(!a.conflicts_with(&a.clone()));
    }

    #[test]
    fn test_toml_round_trip() {
        let r = rule(7, 9000, Protocol::TcpUdp)
            .with_source_ip(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)))
            .with_pool_size(3);
        let text = toml::to_string(&r).unwrap();
        let back: ForwardRule = toml::from_str(&text).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_toml_minimal_rule_uses_defaults() {
        let rule: ForwardRule = toml::from_str(
            r#"
            id = 3
            name = "minimal"
            source_port = 9000
            target_ip = "10.0.0.5"
            target_port = 3306
            protocol = "tcp"
            "#,
        )
        .unwrap();

        assert_eq!(rule.source_ip, None);
        assert!(rule.enabled);
        assert!(rule.auto_reconnect);
        assert_eq!(rule.reconnect_interval_ms, 5_000);
        assert_eq!(rule.max_reconnect_attempts, 10);
        assert_eq!(rule.pool_size, 1);
    }
}
