//! Node configuration types.
//!
//! These structs are the serialized face of a roomnet node: the daemon
//! loads them from TOML, and embedders construct them directly. The core
//! never parses configuration itself; values are handed through to the
//! bridge, the poll engine and the transport at startup.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::poll::PollTuning;
use crate::transport::{PeerId, TransportTuning};

/// Poll engine bounds in microseconds, as they appear in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Interval while traffic is flowing
    pub min_interval_us: u64,
    /// Idle ceiling
    pub max_interval_us: u64,
    /// Backoff step per idle tick
    pub increment_us: u64,
    /// Messages drained per tick at most
    pub max_batch: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_interval_us: 100,
            max_interval_us: 1_000,
            increment_us: 100,
            max_batch: 64,
        }
    }
}

impl PollConfig {
    /// Convert to the engine's tuning struct.
    pub fn to_tuning(&self) -> PollTuning {
        PollTuning {
            min_interval: Duration::from_micros(self.min_interval_us),
            max_interval: Duration::from_micros(self.max_interval_us),
            increment: Duration::from_micros(self.increment_us),
            max_batch: self.max_batch,
        }
    }
}

/// A statically configured room member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Transport identity
    pub id: PeerId,
    /// Transport endpoint the reference UDP transport should use
    pub endpoint: SocketAddr,
    /// The peer's address on the room subnet
    pub address: Ipv4Addr,
}

/// Configuration for a roomnet node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's transport identity
    pub self_id: PeerId,
    /// TUN device name or template; empty selects the platform default
    pub tun_name: String,
    /// Local address on the room subnet
    pub address: Ipv4Addr,
    /// Room subnet mask
    pub netmask: Ipv4Addr,
    /// Interface MTU
    pub mtu: u16,
    /// UDP listen address for the reference transport
    pub listen_addr: String,
    /// UDP listen port for the reference transport
    pub listen_port: u16,
    /// Transport tuning knobs
    pub tuning: TransportTuning,
    /// Poll engine bounds
    pub poll: PollConfig,
    /// Static room roster
    pub peers: Vec<PeerEntry>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            self_id: PeerId::from_raw(1),
            tun_name: String::new(),
            address: Ipv4Addr::new(10, 77, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            mtu: 1420,
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 48700,
            tuning: TransportTuning::default(),
            poll: PollConfig::default(),
            peers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.address, Ipv4Addr::new(10, 77, 0, 1));
        assert_eq!(config.mtu, 1420);
        assert!(config.peers.is_empty());
        assert!(config.tun_name.is_empty());
    }

    #[test]
    fn test_poll_config_conversion() {
        let tuning = PollConfig::default().to_tuning();
        assert_eq!(tuning.min_interval, Duration::from_micros(100));
        assert_eq!(tuning.max_interval, Duration::from_millis(1));
        assert_eq!(tuning.increment, Duration::from_micros(100));
        assert_eq!(tuning.max_batch, 64);
    }
}
