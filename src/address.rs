//! Peer addresses.
//!
//! Addresses use a multiaddr-like text form:
//!
//! ```text
//! /ip4/203.0.113.7/tcp/4001
//! /ip4/203.0.113.7/tcp/4001/p2p/<hex identity>
//! /ip4/198.51.100.1/tcp/4001/p2p/<relay hex>/p2p-circuit/p2p/<target hex>
//! ```
//!
//! The CLI shorthand `IP:PORT` and `IP:PORT/<hex identity>` is also accepted.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

use crate::identity::Identity;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid peer address {input:?}: {reason}")]
pub struct PeerAddrError {
    pub input: String,
    pub reason: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    /// A socket the peer listens on, optionally pinned to the expected identity.
    Direct {
        socket: SocketAddr,
        peer: Option<Identity>,
    },
    /// A circuit through a relay that holds a reservation for `target`.
    Circuit {
        relay: SocketAddr,
        relay_id: Identity,
        target: Identity,
    },
}

impl PeerAddr {
    pub fn direct(socket: SocketAddr) -> Self {
        PeerAddr::Direct { socket, peer: None }
    }

    /// The identity the dialer should expect to authenticate, if known.
    pub fn peer_id(&self) -> Option<Identity> {
        match self {
            PeerAddr::Direct { peer, .. } => *peer,
            PeerAddr::Circuit { target, .. } => Some(*target),
        }
    }

    pub fn with_peer(self, id: Identity) -> Self {
        match self {
            PeerAddr::Direct { socket, .. } => PeerAddr::Direct { socket, peer: Some(id) },
            PeerAddr::Circuit { relay, relay_id, .. } => PeerAddr::Circuit {
                relay,
                relay_id,
                target: id,
            },
        }
    }

    /// The socket a TCP connection is actually opened to.
    pub fn socket(&self) -> SocketAddr {
        match self {
            PeerAddr::Direct { socket, .. } => *socket,
            PeerAddr::Circuit { relay, .. } => *relay,
        }
    }

    pub fn is_relayed(&self) -> bool {
        matches!(self, PeerAddr::Circuit { .. })
    }

    /// The address to advertise for a bound listener. Unspecified bind
    /// addresses are advertised as loopback.
    pub fn advertised(local: SocketAddr, id: Identity) -> Self {
        let ip = match local.ip() {
            IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        PeerAddr::Direct {
            socket: SocketAddr::new(ip, local.port()),
            peer: Some(id),
        }
    }
}

fn write_socket(f: &mut fmt::Formatter<'_>, socket: &SocketAddr) -> fmt::Result {
    match socket.ip() {
        IpAddr::V4(ip) => write!(f, "/ip4/{ip}/tcp/{}", socket.port()),
        IpAddr::V6(ip) => write!(f, "/ip6/{ip}/tcp/{}", socket.port()),
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Direct { socket, peer } => {
                write_socket(f, socket)?;
                if let Some(peer) = peer {
                    write!(f, "/p2p/{peer}")?;
                }
                Ok(())
            }
            PeerAddr::Circuit { relay, relay_id, target } => {
                write_socket(f, relay)?;
                write!(f, "/p2p/{relay_id}/p2p-circuit/p2p/{target}")
            }
        }
    }
}

impl FromStr for PeerAddr {
    type Err = PeerAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| PeerAddrError {
            input: s.to_string(),
            reason,
        };
        let identity = |hex: &str| Identity::from_hex(hex).map_err(|_| err("invalid identity hex"));

        if !s.starts_with('/') {
            return match s.rsplit_once('/') {
                Some((socket, id)) => Ok(PeerAddr::Direct {
                    socket: socket.parse().map_err(|_| err("invalid socket address"))?,
                    peer: Some(identity(id)?),
                }),
                None => Ok(PeerAddr::direct(
                    s.parse().map_err(|_| err("invalid socket address"))?,
                )),
            };
        }

        let parts: Vec<&str> = s[1..].split('/').collect();
        let ip: IpAddr = match parts.as_slice() {
            ["ip4", ip, ..] => IpAddr::V4(ip.parse().map_err(|_| err("invalid ip4 address"))?),
            ["ip6", ip, ..] => IpAddr::V6(ip.parse().map_err(|_| err("invalid ip6 address"))?),
            _ => return Err(err("expected /ip4 or /ip6")),
        };
        let port: u16 = match parts.get(2..4) {
            Some(["tcp", port]) => port.parse().map_err(|_| err("invalid tcp port"))?,
            _ => return Err(err("expected /tcp/<port>")),
        };
        let socket = SocketAddr::new(ip, port);

        match &parts[4..] {
            [] => Ok(PeerAddr::direct(socket)),
            ["p2p", id] => Ok(PeerAddr::Direct {
                socket,
                peer: Some(identity(id)?),
            }),
            ["p2p", relay_id, "p2p-circuit", "p2p", target] => Ok(PeerAddr::Circuit {
                relay: socket,
                relay_id: identity(relay_id)?,
                target: identity(target)?,
            }),
            _ => Err(err("unrecognized trailing components")),
        }
    }
}
