//! Configuration type definitions.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{ConfigError, ConfigResult};

/// Root configuration for the relay engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// TCP listener and upstream socket tuning.
    pub tcp: TcpSettings,

    /// UDP socket tuning and forwarding mode.
    pub udp: UdpSettings,

    /// Upstream reconnect defaults applied to rules that do not override
    /// them.
    pub reconnect: ReconnectSettings,

    /// Client-side buffering limits.
    pub buffer: BufferSettings,

    /// Idle timeouts and sweep intervals.
    pub timing: TimingSettings,
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the content does not match the schema.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// TCP socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpSettings {
    /// Accept-loop task count per listener.
    pub accept_threads: usize,

    /// I/O worker hint for sizing diagnostics.
    pub worker_threads: usize,

    /// Listener backlog.
    pub so_backlog: u32,

    /// Enable SO_KEEPALIVE on accepted and dialled sockets.
    pub so_keepalive: bool,

    /// Enable TCP_NODELAY on accepted and dialled sockets.
    pub tcp_nodelay: bool,

    /// Read buffer size per connection.
    pub read_buffer_size: usize,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            accept_threads: 1,
            worker_threads: 4,
            so_backlog: 1024,
            so_keepalive: true,
            tcp_nodelay: true,
            read_buffer_size: 16 * 1024,
        }
    }
}

/// UDP forwarding mode for rules with a UDP half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UdpMode {
    /// One outbound socket per downstream address, replies routed back.
    #[default]
    PointToPoint,

    /// Subscription-based fan-out between a downstream and an upstream
    /// socket.
    Broadcast,
}

/// UDP socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpSettings {
    /// Forwarding mode applied to every UDP rule.
    pub mode: UdpMode,

    /// Worker hint for sizing diagnostics.
    pub worker_threads: usize,

    /// SO_RCVBUF for relay sockets.
    pub recv_buffer_size: usize,

    /// SO_SNDBUF for relay sockets.
    pub send_buffer_size: usize,

    /// Largest datagram accepted.
    pub max_datagram_size: usize,
}

impl Default for UdpSettings {
    fn default() -> Self {
        Self {
            mode: UdpMode::PointToPoint,
            worker_threads: 4,
            recv_buffer_size: 65_536,
            send_buffer_size: 65_536,
            max_datagram_size: 65_535,
        }
    }
}

/// Defaults for upstream reconnection, used when building rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Whether closed upstream connections are redialled at all.
    pub enabled: bool,

    /// Base delay between attempts in milliseconds.
    pub interval_ms: u64,

    /// Attempts per slot before the slot gives up.
    pub max_attempts: u32,

    /// Default pool size for new rules.
    pub pool_size: usize,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5_000,
            max_attempts: 10,
            pool_size: 5,
        }
    }
}

/// Client-side buffering limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Per-client pending-payload cap in bytes. Overflow is tail-dropped.
    pub client_buffer_cap: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            client_buffer_cap: 1024 * 1024,
        }
    }
}

/// Idle timeouts and sweep intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Seconds of TCP inactivity before a client is timed out.
    pub tcp_idle_timeout_secs: u64,

    /// Seconds of silence before a UDP session is evicted.
    pub udp_session_timeout_secs: u64,

    /// Seconds between UDP session sweeps.
    pub udp_sweep_interval_secs: u64,

    /// Seconds of missed heartbeats before a broadcast client is evicted.
    pub broadcast_client_timeout_secs: u64,

    /// Seconds between broadcast heartbeat sweeps.
    pub broadcast_sweep_interval_secs: u64,

    /// Seconds granted to per-rule tasks during deactivation before they
    /// are aborted.
    pub shutdown_grace_secs: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            tcp_idle_timeout_secs: 300,
            udp_session_timeout_secs: 300,
            udp_sweep_interval_secs: 60,
            broadcast_client_timeout_secs: 300,
            broadcast_sweep_interval_secs: 60,
            shutdown_grace_secs: 5,
        }
    }
}

impl TimingSettings {
    /// TCP idle timeout as a duration.
    #[must_use]
    pub fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_idle_timeout_secs)
    }

    /// UDP session timeout as a duration.
    #[must_use]
    pub fn udp_session_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_session_timeout_secs)
    }

    /// UDP sweep interval as a duration.
    #[must_use]
    pub fn udp_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.udp_sweep_interval_secs)
    }

    /// Broadcast client timeout as a duration.
    #[must_use]
    pub fn broadcast_client_timeout(&self) -> Duration {
        Duration::from_secs(self.broadcast_client_timeout_secs)
    }

    /// Broadcast sweep interval as a duration.
    #[must_use]
    pub fn broadcast_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_sweep_interval_secs)
    }

    /// Deactivation grace period as a duration.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
