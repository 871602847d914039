//! # Relay Configuration
//!
//! Engine-wide settings: TCP/UDP socket tuning, reconnect defaults, client
//! buffering, and sweep timings. All values have working defaults; a TOML
//! file can override any subset.

mod error;
mod types;

pub use error::{ConfigError, ConfigResult};
pub use types::{
    BufferSettings, ReconnectSettings, RelayConfig, TcpSettings, TimingSettings, UdpMode,
    UdpSettings,
};
