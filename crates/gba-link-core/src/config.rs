use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::joybus::{DEFAULT_TICKS_PER_SECOND, FallbackTable};

/// Default TCP port for the data channel ("d6ba", dolphin gba).
pub const DEFAULT_DATA_PORT: u16 = 0xD6BA;
/// Default TCP port for the clock sync channel ("c10c", clock).
pub const DEFAULT_CLOCK_PORT: u16 = 0xC10C;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub bind_address: IpAddr,
    pub data_port: u16,
    pub clock_port: u16,
    /// Rate of the cycle counter passed to the link on every poll.
    pub ticks_per_second: u64,
    /// Upper bound on how long the accept thread waits for a peer to identify
    /// its port.
    pub handshake_timeout_ms: u64,
    pub fallback: FallbackTable,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            data_port: DEFAULT_DATA_PORT,
            clock_port: DEFAULT_CLOCK_PORT,
            ticks_per_second: DEFAULT_TICKS_PER_SECOND,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            fallback: FallbackTable::default(),
        }
    }
}

impl LinkConfig {
    /// Config bound to an ephemeral loopback port for both channels.
    pub fn loopback_ephemeral() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            data_port: 0,
            clock_port: 0,
            ..Self::default()
        }
    }

    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.data_port)
    }

    pub fn clock_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.clock_port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms.max(1))
    }
}
