//! # Connections
//!
//! Turns raw transport connections into registered gossip peers:
//!
//! ```text
//! RawConnection ─► secure ─► multiplex ─► open gossip stream ─► register ─► overlay
//! ```
//!
//! [`PeerNetwork`] is the peer table. It holds at most one live connection
//! per identity and a bounded outbound gossip queue per peer, and it is the
//! [`GossipRpc`] the overlay sends through. [`Connector`] runs the pipeline
//! for dials and inbound connections and wires each connection's streams to
//! the overlay.
//!
//! ## Duplicate Connections
//!
//! When two peers dial each other at the same time both ends briefly hold
//! two connections. Both keep the one dialed by the smaller identity and
//! close the other, so they always agree on the survivor.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::address::PeerAddr;
use crate::discovery::{DiscoveredPeers, Discovery};
use crate::error::{HandshakeError, NodeError, ProtocolError, TransportError};
use crate::gossipsub::GossipSub;
use crate::identity::Identity;
use crate::mux::{IncomingStreams, MuxConnection, Stream};
use crate::protocols::{GossipRpc, Multiplexer, Role, SecureChannel, Transport};
use crate::transport::{Listener, RawConnection};
use crate::wire::{FrameDecoder, GossipFrame};

/// Protocol id of the gossip stream each side opens.
pub const GOSSIP_PROTOCOL: &str = "/topology/gossip/1.0.0";

/// Frames queued per peer before sends start failing.
const OUTBOUND_QUEUE: usize = 1_024;

const MAX_IN_FLIGHT_DIALS: usize = 64;

/// Dials older than this no longer block a new attempt.
const IN_FLIGHT_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for closing the losing side of a duplicate connection.
const DUPLICATE_CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Behaviour penalty for a peer that sends malformed gossip.
const PROTOCOL_ERROR_PENALTY: f64 = 2.0;

// ============================================================================
// Peer Table
// ============================================================================

struct PeerEntry {
    conn_id: u64,
    conn: MuxConnection,
    dialer: Identity,
    outbound: mpsc::Sender<GossipFrame>,
}

/// Result of offering a new connection to the peer table.
enum Registration {
    Accepted {
        conn_id: u64,
        outbound: mpsc::Receiver<GossipFrame>,
        replaced: Option<MuxConnection>,
    },
    Duplicate,
    Full,
    Closed,
}

/// Whether a connection dialed by `new_dialer` should replace a live one
/// dialed by `existing_dialer`. Connections from the same dialer are
/// replaced by the newer one.
fn prefer_new(local: &Identity, remote: &Identity, existing_dialer: &Identity, new_dialer: &Identity) -> bool {
    if existing_dialer == new_dialer {
        return true;
    }
    let winner = if local < remote { local } else { remote };
    new_dialer == winner
}

/// The live peer table. Cheap to clone.
#[derive(Clone)]
pub struct PeerNetwork {
    local: Identity,
    max_peers: usize,
    peers: Arc<RwLock<HashMap<Identity, PeerEntry>>>,
    next_conn_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for PeerNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerNetwork")
            .field("local", &self.local)
            .field("peers", &self.len())
            .finish()
    }
}

impl PeerNetwork {
    pub fn new(local: Identity, max_peers: usize) -> Self {
        Self {
            local,
            max_peers,
            peers: Arc::new(RwLock::new(HashMap::new())),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connected_peers(&self) -> Vec<Identity> {
        self.peers
            .read()
            .map(|p| p.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, peer: &Identity) -> bool {
        self.peers.read().is_ok_and(|p| p.contains_key(peer))
    }

    pub fn len(&self) -> usize {
        self.peers.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_peers
    }

    fn register(&self, conn: &MuxConnection) -> Registration {
        if self.closed.load(Ordering::Acquire) {
            return Registration::Closed;
        }
        let Ok(mut peers) = self.peers.write() else {
            return Registration::Closed;
        };
        let remote = conn.remote();
        let dialer = match conn.role() {
            Role::Initiator => self.local,
            Role::Responder => remote,
        };

        let replaced = match peers.get(&remote) {
            Some(existing) if !existing.conn.is_closed() => {
                if !prefer_new(&self.local, &remote, &existing.dialer, &dialer) {
                    return Registration::Duplicate;
                }
                Some(existing.conn.clone())
            }
            Some(_) => None,
            None if peers.len() >= self.max_peers => return Registration::Full,
            None => None,
        };

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        peers.insert(
            remote,
            PeerEntry {
                conn_id,
                conn: conn.clone(),
                dialer,
                outbound: tx,
            },
        );
        Registration::Accepted {
            conn_id,
            outbound: rx,
            replaced,
        }
    }

    /// Remove `peer` if its entry still belongs to connection `conn_id`.
    fn remove(&self, peer: &Identity, conn_id: u64) -> bool {
        let Ok(mut peers) = self.peers.write() else {
            return false;
        };
        if peers.get(peer).is_some_and(|e| e.conn_id == conn_id) {
            peers.remove(peer);
            true
        } else {
            false
        }
    }

    /// Stop accepting connections and close every live one, waiting up to
    /// `grace` for each to shut down cleanly.
    pub async fn close_all(&self, grace: Duration) {
        self.closed.store(true, Ordering::Release);
        let conns: Vec<MuxConnection> = match self.peers.write() {
            Ok(mut peers) => peers.drain().map(|(_, e)| e.conn).collect(),
            Err(_) => Vec::new(),
        };
        let count = conns.len();
        let closes = conns.into_iter().map(|conn| async move { conn.close(grace).await });
        join_all(closes).await;
        if count > 0 {
            debug!(count, "closed all connections");
        }
    }
}

/// Run futures concurrently and wait for all of them.
async fn join_all<F>(futures: impl IntoIterator<Item = F>)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let handles: Vec<JoinHandle<()>> = futures.into_iter().map(tokio::spawn).collect();
    for handle in handles {
        let _ = handle.await;
    }
}

#[async_trait]
impl GossipRpc for PeerNetwork {
    async fn send_gossip(&self, to: &Identity, frame: GossipFrame) -> anyhow::Result<()> {
        let outbound = self
            .peers
            .read()
            .map_err(|_| anyhow!("peer table poisoned"))?
            .get(to)
            .map(|e| e.outbound.clone())
            .ok_or_else(|| anyhow!("peer {} not connected", to.short()))?;
        outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("outbound queue to {} full", to.short()),
            mpsc::error::TrySendError::Closed(_) => anyhow!("connection to {} closed", to.short()),
        })
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// The pluggable layers a node is composed from.
#[derive(Clone)]
pub struct Capabilities {
    pub transport: Arc<dyn Transport>,
    pub secure: Arc<dyn SecureChannel>,
    pub muxer: Arc<dyn Multiplexer>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

// ============================================================================
// Connector
// ============================================================================

struct ConnectorInner {
    local: Identity,
    caps: Capabilities,
    network: PeerNetwork,
    gossip: GossipSub,
    discovery: Discovery,
    connect_timeout: Duration,
    in_flight: Mutex<LruCache<Identity, Instant>>,
}

/// Runs the connection pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<ConnectorInner>,
}

impl Connector {
    pub fn new(
        local: Identity,
        caps: Capabilities,
        network: PeerNetwork,
        gossip: GossipSub,
        discovery: Discovery,
        connect_timeout: Duration,
    ) -> Self {
        let cap = NonZeroUsize::new(MAX_IN_FLIGHT_DIALS).expect("MAX_IN_FLIGHT_DIALS must be non-zero");
        Self {
            inner: Arc::new(ConnectorInner {
                local,
                caps,
                network,
                gossip,
                discovery,
                connect_timeout,
                in_flight: Mutex::new(LruCache::new(cap)),
            }),
        }
    }

    pub fn network(&self) -> &PeerNetwork {
        &self.inner.network
    }

    /// Dial a peer at any of `addrs` and run the pipeline. Returns the
    /// authenticated identity.
    pub async fn dial(&self, addrs: &[PeerAddr]) -> Result<Identity, NodeError> {
        let expected = addrs.iter().find_map(PeerAddr::peer_id);
        if let Some(peer) = expected {
            if peer == self.inner.local {
                return Err(NodeError::Internal(anyhow!("refusing to dial self")));
            }
            if self.inner.network.is_connected(&peer) {
                return Ok(peer);
            }
            if !self.begin_dial(peer) {
                return Err(NodeError::Internal(anyhow!("dial to {} already in flight", peer.short())));
            }
        }

        let result = self.dial_once(addrs, expected).await;
        if let Some(peer) = expected {
            self.end_dial(&peer);
        }
        result
    }

    async fn dial_once(&self, addrs: &[PeerAddr], expected: Option<Identity>) -> Result<Identity, NodeError> {
        let deadline = Instant::now() + self.inner.connect_timeout;
        let raw = self.inner.caps.transport.connect(addrs, deadline).await?;
        self.establish(raw, Role::Initiator, expected, deadline).await
    }

    fn begin_dial(&self, peer: Identity) -> bool {
        let Ok(mut in_flight) = self.inner.in_flight.lock() else {
            return false;
        };
        let now = Instant::now();
        if let Some(started) = in_flight.peek(&peer)
            && now.duration_since(*started) < IN_FLIGHT_TIMEOUT
        {
            return false;
        }
        in_flight.put(peer, now);
        true
    }

    fn end_dial(&self, peer: &Identity) {
        if let Ok(mut in_flight) = self.inner.in_flight.lock() {
            in_flight.pop(peer);
        }
    }

    /// Run the pipeline for an inbound connection in the background.
    pub fn accept(&self, raw: RawConnection) {
        let this = self.clone();
        tokio::spawn(async move {
            let remote = raw.remote.clone();
            let deadline = Instant::now() + this.inner.connect_timeout;
            if let Err(e) = this.establish(raw, Role::Responder, None, deadline).await {
                debug!(addr = %remote, error = %e, "inbound connection failed");
            }
        });
    }

    /// Accept every connection produced by `listener` until it is dropped.
    pub fn serve(&self, mut listener: Listener) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(raw) = listener.accept().await {
                this.accept(raw);
            }
        })
    }

    /// Accept connections delivered over a channel, e.g. relayed circuits.
    pub fn serve_channel(&self, mut incoming: mpsc::Receiver<RawConnection>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(raw) = incoming.recv().await {
                this.accept(raw);
            }
        })
    }

    async fn establish(
        &self,
        raw: RawConnection,
        role: Role,
        expected: Option<Identity>,
        deadline: Instant,
    ) -> Result<Identity, NodeError> {
        let carrier = raw.carrier;
        let secured = tokio::time::timeout_at(deadline, self.inner.caps.secure.secure(raw, role, expected))
            .await
            .map_err(|_| HandshakeError::Timeout)??;
        let remote = secured.remote;
        if remote == self.inner.local {
            return Err(NodeError::Internal(anyhow!("connected to self")));
        }

        let (conn, incoming) = self.inner.caps.muxer.multiplex(secured, role);
        let stream = match conn.open_stream(GOSSIP_PROTOCOL, deadline).await {
            Ok(stream) => stream,
            Err(e) => {
                conn.abort();
                return Err(e.into());
            }
        };

        let (conn_id, outbound, replaced) = match self.inner.network.register(&conn) {
            Registration::Accepted {
                conn_id,
                outbound,
                replaced,
            } => (conn_id, outbound, replaced),
            Registration::Duplicate => {
                trace!(peer = %remote.short(), "closing duplicate connection");
                tokio::spawn(async move { conn.close(DUPLICATE_CLOSE_GRACE).await });
                return Ok(remote);
            }
            Registration::Full => {
                conn.abort();
                return Err(NodeError::Transport(TransportError::Unreachable {
                    addr: conn.remote_addr().to_string(),
                    reason: "peer limit reached".into(),
                }));
            }
            Registration::Closed => {
                conn.abort();
                return Err(NodeError::Transport(TransportError::Unreachable {
                    addr: conn.remote_addr().to_string(),
                    reason: "node is stopping".into(),
                }));
            }
        };
        if let Some(old) = replaced {
            trace!(peer = %remote.short(), "replacing duplicate connection");
            tokio::spawn(async move { old.close(DUPLICATE_CLOSE_GRACE).await });
        }

        info!(
            peer = %remote.short(),
            addr = %conn.remote_addr(),
            carrier,
            role = ?role,
            "peer connected"
        );

        tokio::spawn(write_gossip(stream, outbound, remote));
        tokio::spawn(accept_streams(incoming, conn.clone(), self.inner.gossip.clone()));
        tokio::spawn(watch_connection(
            conn,
            conn_id,
            self.inner.network.clone(),
            self.inner.gossip.clone(),
        ));

        self.inner.gossip.peer_connected(remote).await;
        self.inner.discovery.announce();
        Ok(remote)
    }
}

// ============================================================================
// Per-connection tasks
// ============================================================================

async fn write_gossip(mut stream: Stream, mut outbound: mpsc::Receiver<GossipFrame>, remote: Identity) {
    while let Some(frame) = outbound.recv().await {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %remote.short(), error = %e, "failed to encode gossip frame");
                continue;
            }
        };
        if let Err(e) = stream.send(&bytes).await {
            trace!(peer = %remote.short(), error = %e, "gossip stream write failed");
            return;
        }
    }
    stream.close();
}

async fn accept_streams(mut incoming: IncomingStreams, conn: MuxConnection, gossip: GossipSub) {
    while let Some(stream) = incoming.recv().await {
        if stream.protocol() != GOSSIP_PROTOCOL {
            debug!(
                peer = %stream.remote().short(),
                protocol = stream.protocol(),
                "resetting stream with unsupported protocol"
            );
            continue;
        }
        let conn = conn.clone();
        let gossip = gossip.clone();
        tokio::spawn(async move {
            let remote = stream.remote();
            if let Err(e) = read_gossip(stream, &gossip).await {
                warn!(peer = %remote.short(), error = %e, "gossip protocol violation, closing connection");
                gossip.penalize(remote, PROTOCOL_ERROR_PENALTY).await;
                conn.abort();
            }
        });
    }
}

async fn read_gossip(mut stream: Stream, gossip: &GossipSub) -> Result<(), ProtocolError> {
    let remote = stream.remote();
    let mut decoder = FrameDecoder::new();
    while let Some(chunk) = stream.recv().await {
        decoder.extend(&chunk);
        while let Some(frame) = decoder.next_frame()? {
            if gossip.inbound(remote, frame).await.is_err() {
                return Ok(());
            }
        }
    }
    if decoder.buffered() > 0 {
        debug!(peer = %remote.short(), bytes = decoder.buffered(), "gossip stream ended mid-frame");
    }
    Ok(())
}

async fn watch_connection(conn: MuxConnection, conn_id: u64, network: PeerNetwork, gossip: GossipSub) {
    conn.closed().await;
    let remote = conn.remote();
    if network.remove(&remote, conn_id) {
        info!(peer = %remote.short(), "peer disconnected");
        gossip.peer_disconnected(remote).await;
    }
}

// ============================================================================
// Background dialing
// ============================================================================

/// Dial bootstrap peers now, then again every `interval` while the node has
/// no connections.
pub async fn bootstrap_loop(connector: Connector, addrs: Vec<PeerAddr>, interval: Duration) {
    if addrs.is_empty() {
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if !connector.network().is_empty() {
            continue;
        }
        for addr in &addrs {
            match connector.dial(std::slice::from_ref(addr)).await {
                Ok(peer) => debug!(addr = %addr, peer = %peer.short(), "bootstrap peer connected"),
                Err(e) => warn!(addr = %addr, error = %e, "bootstrap dial failed"),
            }
        }
    }
}

/// Dial newly discovered peers while below the peer limit.
pub async fn discovery_dial_loop(connector: Connector, mut discovered: DiscoveredPeers) {
    while let Some(record) = discovered.next().await {
        if connector.network().is_full() || connector.network().is_connected(&record.peer_id) {
            continue;
        }
        let addrs: Vec<PeerAddr> = record
            .addrs
            .iter()
            .filter_map(|a| a.parse::<PeerAddr>().ok())
            .map(|a| a.with_peer(record.peer_id))
            .collect();
        if addrs.is_empty() {
            continue;
        }
        let connector = connector.clone();
        tokio::spawn(async move {
            if let Err(e) = connector.dial(&addrs).await {
                debug!(peer = %record.peer_id.short(), error = %e, "dial to discovered peer failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::discovery::{DiscoveryConfig, RecordStore};
    use crate::gossipsub::{GossipSubConfig, Subscribers};
    use crate::identity::Keypair;
    use crate::mux::{FrameMux, MuxConfig};
    use crate::secure::Negotiator;
    use crate::transport::TcpTransport;

    #[test]
    fn duplicate_tie_break_agrees_on_both_sides() {
        let a = Keypair::generate().identity();
        let b = Keypair::generate().identity();
        let (small, large) = if a < b { (a, b) } else { (b, a) };

        // Small side holds the connection large dialed; the one it dialed wins.
        assert!(prefer_new(&small, &large, &large, &small));
        assert!(!prefer_new(&small, &large, &small, &large));
        // Large side mirrors the decision.
        assert!(!prefer_new(&large, &small, &small, &large));
        assert!(prefer_new(&large, &small, &large, &small));
        // Same dialer twice: the newer connection replaces the old one.
        assert!(prefer_new(&small, &large, &large, &large));
    }

    #[tokio::test]
    async fn peer_table_tracks_connections_by_id() {
        let (a, b) = crate::mux::tests::secured_pair().await;
        let local = a.local;
        let remote = a.remote;
        let (conn, _incoming) = crate::mux::spawn(a, Role::Initiator, MuxConfig::default());
        let (_peer_side, _peer_incoming) = crate::mux::spawn(b, Role::Responder, MuxConfig::default());

        let network = PeerNetwork::new(local, 4);
        let frame = GossipFrame::Graft { topic: "t".into() };
        assert!(network.send_gossip(&remote, frame.clone()).await.is_err());

        let Registration::Accepted {
            conn_id, mut outbound, ..
        } = network.register(&conn)
        else {
            panic!("first connection must be accepted");
        };
        assert_eq!(network.connected_peers(), vec![remote]);
        network.send_gossip(&remote, frame.clone()).await.unwrap();
        assert_eq!(outbound.recv().await, Some(frame));

        assert!(!network.remove(&remote, conn_id + 1), "stale id leaves the entry");
        assert!(network.remove(&remote, conn_id));
        assert!(network.is_empty());
    }

    #[tokio::test]
    async fn full_table_rejects_new_peers() {
        let (a, _b) = crate::mux::tests::secured_pair().await;
        let local = a.local;
        let (conn, _incoming) = crate::mux::spawn(a, Role::Initiator, MuxConfig::default());
        let network = PeerNetwork::new(local, 1);
        network.peers.write().unwrap().insert(
            Keypair::generate().identity(),
            PeerEntry {
                conn_id: 99,
                conn: conn.clone(),
                dialer: local,
                outbound: mpsc::channel(1).0,
            },
        );
        assert!(matches!(network.register(&conn), Registration::Full));
    }

    struct Peer {
        connector: Connector,
        gossip: GossipSub,
        identity: Identity,
    }

    async fn peer() -> Peer {
        let keypair = Keypair::generate();
        let identity = keypair.identity();
        let network = PeerNetwork::new(identity, 8);
        let subscribers = Subscribers::new();
        let records = RecordStore::new(64);
        let (px_tx, px_rx) = mpsc::channel(8);
        let (gossip, _messages) = GossipSub::spawn(
            Arc::new(network.clone()),
            keypair.clone(),
            GossipSubConfig::default(),
            subscribers.clone(),
            records.clone(),
            px_tx,
        );
        let (discovery, _) = Discovery::spawn(
            keypair.clone(),
            DiscoveryConfig::default(),
            gossip.clone(),
            &subscribers,
            records,
            px_rx,
            Arc::new(Vec::<String>::new),
        )
        .await
        .unwrap();
        let caps = Capabilities {
            transport: Arc::new(TcpTransport::new(RetryPolicy::default())),
            secure: Arc::new(Negotiator::new(keypair)),
            muxer: Arc::new(FrameMux::new(MuxConfig::default())),
        };
        let connector = Connector::new(identity, caps, network, gossip.clone(), discovery, Duration::from_secs(5));
        Peer {
            connector,
            gossip,
            identity,
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn dial_registers_both_sides_and_carries_gossip() {
        let a = peer().await;
        let b = peer().await;
        let listener = b
            .connector
            .inner
            .caps
            .transport
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = PeerAddr::direct(listener.local_addr()).with_peer(b.identity);
        let _serve = b.connector.serve(listener);

        assert_eq!(a.connector.dial(&[addr.clone()]).await.unwrap(), b.identity);
        wait_for(|| b.connector.network().is_connected(&a.identity)).await;
        assert!(a.connector.network().is_connected(&b.identity));

        // A second dial reuses the live connection.
        assert_eq!(a.connector.dial(&[addr]).await.unwrap(), b.identity);
        assert_eq!(a.connector.network().len(), 1);

        // Subscriptions travel over the gossip stream.
        b.gossip.subscribe("chat").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while a.gossip.topic_peers("chat").await != vec![b.identity] {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscription announced");

        // Closing the connection removes the peer on the other side.
        a.connector.network().close_all(Duration::from_millis(200)).await;
        wait_for(|| !b.connector.network().is_connected(&a.identity)).await;
    }

    #[tokio::test]
    async fn dialing_wrong_identity_fails() {
        let a = peer().await;
        let b = peer().await;
        let listener = b
            .connector
            .inner
            .caps
            .transport
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let impostor = Keypair::generate().identity();
        let addr = PeerAddr::direct(listener.local_addr()).with_peer(impostor);
        let _serve = b.connector.serve(listener);

        let err = a.connector.dial(&[addr]).await.unwrap_err();
        assert!(matches!(err, NodeError::Handshake(HandshakeError::IdentityMismatch { .. })));
        assert!(a.connector.network().is_empty());

        let own = PeerAddr::direct("127.0.0.1:1".parse().unwrap()).with_peer(a.identity);
        assert!(a.connector.dial(&[own]).await.is_err());
    }
}
