//! Node configuration.
//!
//! [`NodeConfig::default`] gives a working node listening on an ephemeral
//! port with no bootstrap peers. Component settings nest as their own
//! structs so each layer can be tuned in isolation.

use std::net::SocketAddr;
use std::time::Duration;

use crate::address::PeerAddr;
use crate::discovery::DiscoveryConfig;
use crate::error::ConfigError;
use crate::gossipsub::GossipSubConfig;
use crate::mux::MuxConfig;

/// Retry schedule for outbound dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen: Vec<SocketAddr>,
    /// Addresses to advertise in addition to the bound listen addresses.
    pub external_addrs: Vec<String>,
    pub bootstrap: Vec<String>,
    /// Re-dial period for bootstrap peers while the node has no connections.
    pub bootstrap_interval: Duration,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_peers: usize,
    /// Relays to hold reservations on, as `IP:PORT/<hex id>` or multiaddr.
    pub relays: Vec<String>,
    /// Serve relay reservations and circuits for other peers.
    pub relay_server: bool,
    pub gossip: GossipSubConfig,
    pub discovery: DiscoveryConfig,
    pub mux: MuxConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: vec![SocketAddr::from(([0, 0, 0, 0], 0))],
            external_addrs: Vec::new(),
            bootstrap: Vec::new(),
            bootstrap_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
            max_peers: 50,
            relays: Vec::new(),
            relay_server: false,
            gossip: GossipSubConfig::default(),
            discovery: DiscoveryConfig::default(),
            mux: MuxConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "listen",
                reason: "at least one listen address is required",
            });
        }
        self.bootstrap_addrs()?;
        self.relay_addrs()?;
        for addr in &self.external_addrs {
            parse_addr(addr)?;
        }
        if self.gossip.mesh_n == 0 {
            return Err(ConfigError::InvalidValue {
                field: "gossip.mesh_n",
                reason: "mesh degree must be positive",
            });
        }
        if self.gossip.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "gossip.heartbeat_interval",
                reason: "must be non-zero",
            });
        }
        if self.discovery.interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "discovery.interval",
                reason: "must be non-zero",
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts",
                reason: "at least one attempt is required",
            });
        }
        if self.max_peers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_peers",
                reason: "must be positive",
            });
        }
        if self.mux.initial_window == 0 || self.mux.max_streams == 0 {
            return Err(ConfigError::InvalidValue {
                field: "mux",
                reason: "window and stream limit must be positive",
            });
        }
        Ok(())
    }

    pub fn bootstrap_addrs(&self) -> Result<Vec<PeerAddr>, ConfigError> {
        self.bootstrap.iter().map(|a| parse_addr(a)).collect()
    }

    /// Relay addresses. Each must name the relay's identity.
    pub fn relay_addrs(&self) -> Result<Vec<PeerAddr>, ConfigError> {
        self.relays
            .iter()
            .map(|a| {
                let addr = parse_addr(a)?;
                match addr {
                    PeerAddr::Direct { peer: Some(_), .. } => Ok(addr),
                    _ => Err(ConfigError::InvalidAddress {
                        addr: a.clone(),
                        reason: "relay address must be direct and carry the relay identity".into(),
                    }),
                }
            })
            .collect()
    }
}

fn parse_addr(addr: &str) -> Result<PeerAddr, ConfigError> {
    addr.parse().map_err(|e: crate::address::PeerAddrError| ConfigError::InvalidAddress {
        addr: addr.to_string(),
        reason: e.reason.to_string(),
    })
}
