//! Capability traits for the networking layers.
//!
//! The node composes its stack from these seams, so any layer can be swapped
//! without touching the overlay logic above it.
//!
//! | Layer | Trait | Standard implementation |
//! |-------|-------|-------------------------|
//! | Transport | [`Transport`] | [`crate::transport::TcpTransport`] |
//! | Secure channel | [`SecureChannel`] | [`crate::secure::Negotiator`] |
//! | Multiplexer | [`Multiplexer`] | [`crate::mux::FrameMux`] |
//! | Gossip delivery | [`GossipRpc`] | [`crate::connection::PeerNetwork`] |
//!
//! Secure channels hand the multiplexer a pair of boxed [`FrameRead`] /
//! [`FrameWrite`] halves, so a multiplexer never depends on how frames are
//! protected.

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use crate::address::PeerAddr;
use crate::error::{HandshakeError, ProtocolError, TransportError};
use crate::identity::Identity;
use crate::mux::{IncomingStreams, MuxConnection};
use crate::secure::SecuredConnection;
use crate::transport::{Listener, RawConnection};
use crate::wire::GossipFrame;

/// Which side of a connection we are. The dialer is always the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a peer reachable at any of `addrs`, trying carriers in
    /// priority order and retrying per the transport's policy until `deadline`.
    async fn connect(&self, addrs: &[PeerAddr], deadline: Instant) -> Result<RawConnection, TransportError>;

    /// Bind `addr` and start producing inbound connections.
    async fn listen(&self, addr: SocketAddr) -> Result<Listener, TransportError>;
}

#[async_trait]
pub trait SecureChannel: Send + Sync {
    /// Run the handshake over `raw`. When `expected` is set the authenticated
    /// remote identity must match it.
    async fn secure(
        &self,
        raw: RawConnection,
        role: Role,
        expected: Option<Identity>,
    ) -> Result<SecuredConnection, HandshakeError>;
}

pub trait Multiplexer: Send + Sync {
    fn multiplex(&self, conn: SecuredConnection, role: Role) -> (MuxConnection, IncomingStreams);
}

/// Delivery of gossip frames to connected peers.
#[async_trait]
pub trait GossipRpc: Send + Sync + 'static {
    async fn send_gossip(&self, to: &Identity, frame: GossipFrame) -> Result<()>;
}

/// Receiving half of a framed secure channel.
#[async_trait]
pub trait FrameRead: Send {
    /// Next authenticated frame, or `None` on a clean close.
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError>;
}

/// Sending half of a framed secure channel.
#[async_trait]
pub trait FrameWrite: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ProtocolError>;

    async fn shutdown(&mut self) -> Result<(), ProtocolError>;

    /// Largest plaintext accepted by [`FrameWrite::write_frame`].
    fn max_frame_len(&self) -> usize;
}
