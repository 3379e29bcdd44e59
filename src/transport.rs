//! # Carrier Transport Layer
//!
//! Produces raw bidirectional byte streams to and from peers. A dial walks
//! the configured carriers in priority order:
//!
//! ```text
//!            connect(addrs)
//!                 │
//!     ┌───────────┴───────────┐
//!     ▼                       ▼
//!  Direct (0)            Relay (1)
//!  TCP to peer           TCP to relay, circuit to peer
//! ```
//!
//! A full sweep that fails on every carrier is retried with exponential
//! backoff until the retry policy or the caller's deadline is exhausted.
//!
//! ## Preamble
//!
//! Every TCP connection opens with `TPN1` plus a kind byte so one listening
//! socket can serve peers and relay clients alike:
//!
//! | Kind | Byte | Body |
//! |------|------|------|
//! | Direct | 0x01 | none |
//! | Reserve | 0x02 | identity, timestamp, signature |
//! | Connect | 0x03 | target identity |
//! | Accept | 0x04 | session id |

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::address::PeerAddr;
use crate::config::RetryPolicy;
use crate::error::TransportError;
use crate::identity::Identity;
use crate::protocols::Transport;
use crate::relay::{self, RelayServer, ReserveRequest};

pub(crate) const PREAMBLE_MAGIC: [u8; 4] = *b"TPN1";

/// Time allowed for a fresh inbound socket to identify itself.
pub const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Inbound connections waiting to be picked up by the node.
const LISTENER_BACKLOG: usize = 128;

pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// An unauthenticated byte stream to a peer.
pub struct RawConnection {
    pub io: BoxedIo,
    /// The dialed address for outbound connections, the observed socket for
    /// inbound ones.
    pub remote: PeerAddr,
    pub carrier: &'static str,
}

impl RawConnection {
    pub fn new(io: impl Io + 'static, remote: PeerAddr, carrier: &'static str) -> Self {
        Self {
            io: Box::new(io),
            remote,
            carrier,
        }
    }
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection")
            .field("remote", &self.remote.to_string())
            .field("carrier", &self.carrier)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Preamble {
    Direct,
    Reserve(ReserveRequest),
    Connect { target: Identity },
    Accept { session: [u8; 16] },
}

impl Preamble {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = PREAMBLE_MAGIC.to_vec();
        match self {
            Preamble::Direct => out.push(0x01),
            Preamble::Reserve(req) => {
                out.push(0x02);
                out.extend_from_slice(req.identity.as_bytes());
                out.extend_from_slice(&req.timestamp_ms.to_le_bytes());
                out.extend_from_slice(&req.signature);
            }
            Preamble::Connect { target } => {
                out.push(0x03);
                out.extend_from_slice(target.as_bytes());
            }
            Preamble::Accept { session } => {
                out.push(0x04);
                out.extend_from_slice(session);
            }
        }
        out
    }

    pub(crate) async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        let mut head = [0u8; 5];
        reader.read_exact(&mut head).await?;
        if head[..4] != PREAMBLE_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad preamble magic"));
        }
        match head[4] {
            0x01 => Ok(Preamble::Direct),
            0x02 => {
                let mut identity = [0u8; 32];
                let mut ts = [0u8; 8];
                let mut signature = vec![0u8; 64];
                reader.read_exact(&mut identity).await?;
                reader.read_exact(&mut ts).await?;
                reader.read_exact(&mut signature).await?;
                Ok(Preamble::Reserve(ReserveRequest {
                    identity: Identity::from_bytes(identity),
                    timestamp_ms: u64::from_le_bytes(ts),
                    signature,
                }))
            }
            0x03 => {
                let mut target = [0u8; 32];
                reader.read_exact(&mut target).await?;
                Ok(Preamble::Connect {
                    target: Identity::from_bytes(target),
                })
            }
            0x04 => {
                let mut session = [0u8; 16];
                reader.read_exact(&mut session).await?;
                Ok(Preamble::Accept { session })
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown preamble kind 0x{other:02x}"),
            )),
        }
    }

    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await
    }
}

/// One way of reaching a peer.
#[async_trait]
pub trait Carrier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower values are tried first.
    fn priority(&self) -> u8;

    fn can_dial(&self, addr: &PeerAddr) -> bool;

    async fn dial(&self, addr: &PeerAddr) -> Result<RawConnection, TransportError>;
}

pub(crate) fn unreachable(addr: &PeerAddr, reason: impl ToString) -> TransportError {
    TransportError::Unreachable {
        addr: addr.to_string(),
        reason: reason.to_string(),
    }
}

/// Plain TCP straight to the peer's listening socket.
pub struct DirectCarrier;

#[async_trait]
impl Carrier for DirectCarrier {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn priority(&self) -> u8 {
        0
    }

    fn can_dial(&self, addr: &PeerAddr) -> bool {
        matches!(addr, PeerAddr::Direct { .. })
    }

    async fn dial(&self, addr: &PeerAddr) -> Result<RawConnection, TransportError> {
        let mut stream = TcpStream::connect(addr.socket())
            .await
            .map_err(|e| unreachable(addr, e))?;
        stream.set_nodelay(true)?;
        Preamble::Direct.write_to(&mut stream).await?;
        Ok(RawConnection::new(stream, addr.clone(), self.name()))
    }
}

/// A circuit through a relay holding a reservation for the target.
pub struct RelayCarrier;

#[async_trait]
impl Carrier for RelayCarrier {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn can_dial(&self, addr: &PeerAddr) -> bool {
        addr.is_relayed()
    }

    async fn dial(&self, addr: &PeerAddr) -> Result<RawConnection, TransportError> {
        let PeerAddr::Circuit { relay, target, .. } = addr else {
            return Err(TransportError::UnsupportedAddress(addr.to_string()));
        };
        let stream = relay::open_circuit(*relay, *target).await?;
        Ok(RawConnection::new(stream, addr.clone(), self.name()))
    }
}

/// Inbound connection source returned by [`Transport::listen`].
///
/// Dropping the listener stops its accept loop and releases the socket.
pub struct Listener {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<RawConnection>,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn new(local_addr: SocketAddr, incoming: mpsc::Receiver<RawConnection>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            local_addr,
            incoming,
            task,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&mut self) -> Option<RawConnection> {
        self.incoming.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// TCP transport with direct and relay carriers.
pub struct TcpTransport {
    carriers: Vec<Arc<dyn Carrier>>,
    retry: RetryPolicy,
    relay_server: Option<RelayServer>,
}

impl TcpTransport {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            carriers: vec![Arc::new(DirectCarrier), Arc::new(RelayCarrier)],
            retry,
            relay_server: None,
        }
    }

    /// Serve relay reservations and circuits on every listener.
    pub fn with_relay_server(mut self, server: RelayServer) -> Self {
        self.relay_server = Some(server);
        self
    }

    fn plan<'a>(&'a self, addrs: &'a [PeerAddr]) -> Vec<(&'a Arc<dyn Carrier>, &'a PeerAddr)> {
        let mut plan: Vec<_> = self
            .carriers
            .iter()
            .flat_map(|carrier| {
                addrs
                    .iter()
                    .filter(move |addr| carrier.can_dial(addr))
                    .map(move |addr| (carrier, addr))
            })
            .collect();
        // Stable: addresses keep their order within one priority.
        plan.sort_by_key(|(carrier, _)| carrier.priority());
        plan
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addrs: &[PeerAddr], deadline: Instant) -> Result<RawConnection, TransportError> {
        let plan = self.plan(addrs);
        if plan.is_empty() {
            let joined: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
            return Err(TransportError::UnsupportedAddress(joined.join(", ")));
        }

        let mut backoff = self.retry.initial_backoff;
        let mut last_err = None;

        for attempt in 1..=self.retry.max_attempts {
            for (carrier, addr) in &plan {
                if Instant::now() >= deadline {
                    return Err(TransportError::Timeout);
                }
                match tokio::time::timeout_at(deadline, carrier.dial(addr)).await {
                    Ok(Ok(conn)) => {
                        trace!(addr = %addr, carrier = carrier.name(), attempt, "dial succeeded");
                        return Ok(conn);
                    }
                    Ok(Err(e)) => {
                        debug!(addr = %addr, carrier = carrier.name(), attempt, error = %e, "dial failed");
                        last_err = Some(e);
                    }
                    Err(_) => return Err(TransportError::Timeout),
                }
            }

            if attempt == self.retry.max_attempts {
                break;
            }
            let now = Instant::now();
            if now + backoff >= deadline {
                tokio::time::sleep_until(deadline).await;
                return Err(TransportError::Timeout);
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.retry.max_backoff);
        }

        Err(last_err.unwrap_or_else(|| unreachable(plan[0].1, "all carriers exhausted")))
    }

    async fn listen(&self, addr: SocketAddr) -> Result<Listener, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        let relay_server = self.relay_server.clone();

        let task = tokio::spawn(accept_loop(listener, tx, relay_server));
        debug!(addr = %local_addr, "listening");
        Ok(Listener::new(local_addr, rx, Some(task)))
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<RawConnection>, relay_server: Option<RelayServer>) {
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        if tx.is_closed() {
            break;
        }
        let _ = stream.set_nodelay(true);

        let tx = tx.clone();
        let relay_server = relay_server.clone();
        tokio::spawn(async move {
            let preamble = match tokio::time::timeout(PREAMBLE_TIMEOUT, Preamble::read_from(&mut stream)).await {
                Ok(Ok(preamble)) => preamble,
                Ok(Err(e)) => {
                    debug!(peer = %peer, error = %e, "rejecting connection with bad preamble");
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer, "preamble timed out");
                    return;
                }
            };

            match (preamble, relay_server) {
                (Preamble::Direct, _) => {
                    let conn = RawConnection::new(stream, PeerAddr::direct(peer), "direct");
                    if tx.send(conn).await.is_err() {
                        trace!(peer = %peer, "listener closed, dropping inbound connection");
                    }
                }
                (relay_request, Some(server)) => server.handle(stream, relay_request, peer).await,
                (_, None) => debug!(peer = %peer, "relay request on a node without relay service"),
            }
        });
    }
}
