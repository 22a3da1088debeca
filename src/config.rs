//! Node configuration.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

/// Well-known bootstrap routers used when no other contacts are known.
pub const DEFAULT_ROUTERS: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// Rejected configurations; fatal to [`crate::Dht::new`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid node id length: {0} bytes, expected 20")]
    InvalidNodeId(usize),

    /// An IPv6 external address cannot derive the id of a node bound to an
    /// IPv4 socket.
    #[error("external ip family does not match the bind family")]
    AmbiguousIpFamily,

    #[error("failed to bind udp socket: {0}")]
    Bind(#[from] std::io::Error),
}

/// Tunables for a DHT node. All fields have workable defaults; most
/// deployments only set `port` and perhaps `routers`.
#[derive(Debug, Clone)]
pub struct Config {
    /// UDP port to bind; 0 picks an ephemeral port.
    pub port: u16,

    /// 20-byte node id, typically restored by a persistence layer. A fresh
    /// id is generated when absent.
    pub node_id: Option<Vec<u8>>,

    /// Publicly visible address, when known. Newly generated ids are then
    /// derived from it instead of being uniformly random.
    pub external_ip: Option<IpAddr>,

    /// Bootstrap routers as `host:port` strings.
    pub routers: Vec<String>,

    /// Ceiling on routing-table contacts.
    pub max_nodes: usize,

    /// Stop collecting peers for an infohash once this many have been
    /// delivered; 0 collects without bound.
    pub num_target_peers: usize,

    /// Period of the bucket-refresh and storage-GC sweep.
    pub cleanup_period: Duration,

    /// Outgoing packets per second; 0 disables rate limiting.
    pub rate_limit: u32,
}

impl Config {
    /// The router list as a single comma-joined flag value.
    pub fn routers_joined(&self) -> String {
        self.routers.join(",")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 0,
            node_id: None,
            external_ip: None,
            routers: DEFAULT_ROUTERS.iter().map(|s| s.to_string()).collect(),
            max_nodes: 500,
            num_target_peers: 5,
            cleanup_period: Duration::from_secs(15 * 60),
            rate_limit: 100,
        }
    }
}
