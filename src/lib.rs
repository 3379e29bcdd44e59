//! # Topology - Gossip Publish/Subscribe Overlay
//!
//! Topology is a from-scratch peer-to-peer networking core:
//!
//! - **Identity**: Ed25519 keypairs; the public key is the peer identity
//! - **Transport**: TCP with retry/backoff, plus relay circuits for unreachable peers
//! - **Secure Channel**: X25519 handshake authenticated by Ed25519, ChaCha20-Poly1305 framing
//! - **Multiplexer**: many flow-controlled logical streams over one secured connection
//! - **Discovery**: signed peer records gossiped on a reserved topic
//! - **PubSub**: GossipSub mesh dissemination with deduplication and peer scoring
//!
//! ## Architecture
//!
//! Stateful components use the **Actor Pattern**:
//! - Each component (GossipSub, Discovery, Relay, connection multiplexer) has a
//!   public Handle and a private Actor
//! - Handles are cheap to clone and communicate via async channels
//! - Actors own all mutable state and process commands sequentially
//!
//! The layers below the overlay are composed through the capability traits in
//! [`protocols`], so a node can run over any transport, secure channel or
//! multiplexer that implements them.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Lifecycle and the public pub/sub API |
//! | `config` | Node configuration and validation |
//! | `identity` | Keypairs, identities, signed peer records |
//! | `crypto` | Domain-separated signatures and AEAD session ciphers |
//! | `address` | Direct and relay-circuit peer addresses |
//! | `transport` | TCP transport, carriers, listeners |
//! | `relay` | Relay server and reservation client |
//! | `secure` | Authenticated key exchange and encrypted framing |
//! | `mux` | Stream multiplexer |
//! | `connection` | Connection pipeline and the peer table |
//! | `discovery` | Peer record gossip |
//! | `gossipsub` | Mesh-based publish/subscribe |
//! | `wire` | Gossip frame codec |
//! | `protocols` | Capability traits |
//! | `error` | Error taxonomy |

pub mod address;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod gossipsub;
pub mod identity;
pub mod mux;
pub mod node;
pub mod protocols;
pub mod relay;
pub mod secure;
pub mod transport;
pub mod wire;

pub use address::PeerAddr;
pub use config::{NodeConfig, RetryPolicy};
pub use connection::Capabilities;
pub use discovery::{DISCOVERY_TOPIC, DiscoveredPeers, DiscoveryConfig};
pub use error::{ApplicationError, ConfigError, HandshakeError, NodeError, ProtocolError, TransportError};
pub use gossipsub::{GossipSubConfig, HandlerId, Message, MessageHandler};
pub use identity::{Identity, Keypair, PeerRecord};
pub use mux::MuxConfig;
pub use node::{Node, NodeStatus};
pub use protocols::{Multiplexer, Role, SecureChannel, Transport};
pub use wire::{MAX_PAYLOAD_SIZE, MessageId};
