//! # Circuit Relay
//!
//! Lets peers that cannot accept direct connections be reached through a
//! publicly reachable node. The relay only shuttles bytes; the secure
//! channel runs end to end through the circuit.
//!
//! ## Protocol
//!
//! All messages ride the transport preamble of a fresh TCP connection to
//! the relay's regular listen socket:
//!
//! ```text
//!  target                      relay                       dialer
//!    │── Reserve(id,ts,sig) ──►│                             │
//!    │◄──────── OK ────────────│                             │
//!    │                         │◄──────── Connect(target) ───│
//!    │◄─ Incoming(session) ────│                             │
//!    │── (new conn) Accept ───►│                             │
//!    │◄──────── OK ────────────│───────── OK ───────────────►│
//!    │◄═════════════ spliced byte stream ═══════════════════►│
//! ```
//!
//! A reservation lives as long as its TCP connection. A dialer whose target
//! does not accept within [`RELAY_ACCEPT_TIMEOUT`] gets [`STATUS_TIMEOUT`].
//!
//! ## Components
//!
//! - [`RelayServer`]: actor holding reservations and pending circuits.
//! - [`RelayClient`]: keeps reservations alive on configured relays and
//!   turns accepted circuits into inbound connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use lru::LruCache;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::address::PeerAddr;
use crate::config::RetryPolicy;
use crate::crypto::{RELAY_RESERVE_SIGNATURE_DOMAIN, sign_with_domain, verify_with_domain};
use crate::error::TransportError;
use crate::identity::{FreshnessError, Identity, Keypair, check_timestamp, now_ms};
use crate::transport::{PREAMBLE_TIMEOUT, Preamble, RawConnection};

/// How long a dialer waits for the target to accept a circuit.
pub const RELAY_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum age of a reservation request signature.
pub const RESERVATION_FRESHNESS: Duration = Duration::from_secs(60);

pub const MAX_RESERVATIONS: usize = 1_024;

pub const MAX_PENDING_CIRCUITS: usize = 4_096;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_NO_RESERVATION: u8 = 0x01;
pub const STATUS_TIMEOUT: u8 = 0x02;
pub const STATUS_REJECTED: u8 = 0x03;

/// Pushed over a reservation connection when a dialer wants a circuit.
const INCOMING_TAG: u8 = 0x10;

pub type SessionId = [u8; 16];

fn status_error(status: u8) -> TransportError {
    let reason = match status {
        STATUS_NO_RESERVATION => "target holds no reservation",
        STATUS_TIMEOUT => "target did not accept in time",
        STATUS_REJECTED => "request rejected",
        _ => "unknown relay status",
    };
    TransportError::RelayRefused(reason.to_string())
}

async fn read_status(stream: &mut TcpStream, wait: Duration) -> Result<u8, TransportError> {
    let mut status = [0u8; 1];
    match tokio::time::timeout(wait, stream.read_exact(&mut status)).await {
        Ok(Ok(_)) => Ok(status[0]),
        Ok(Err(e)) => Err(TransportError::Io(e)),
        Err(_) => Err(TransportError::Timeout),
    }
}

async fn connect_relay(relay: SocketAddr, preamble: &Preamble) -> Result<TcpStream, TransportError> {
    let mut stream = TcpStream::connect(relay)
        .await
        .map_err(|e| TransportError::Unreachable {
            addr: relay.to_string(),
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true)?;
    preamble.write_to(&mut stream).await?;
    Ok(stream)
}

/// Ask `relay` for a circuit to `target`. Returns the spliced stream once
/// the target accepted.
pub(crate) async fn open_circuit(relay: SocketAddr, target: Identity) -> Result<TcpStream, TransportError> {
    let mut stream = connect_relay(relay, &Preamble::Connect { target }).await?;
    match read_status(&mut stream, RELAY_ACCEPT_TIMEOUT + PREAMBLE_TIMEOUT).await? {
        STATUS_OK => {
            trace!(relay = %relay, dest = %target.short(), "relay circuit open");
            Ok(stream)
        }
        status => Err(status_error(status)),
    }
}

// ============================================================================
// ReserveRequest
// ============================================================================

/// Signed proof that the holder of `identity` asked for a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub identity: Identity,
    pub timestamp_ms: u64,
    pub signature: Vec<u8>,
}

impl ReserveRequest {
    fn signed_payload(identity: &Identity, timestamp_ms: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(40);
        data.extend_from_slice(identity.as_bytes());
        data.extend_from_slice(&timestamp_ms.to_le_bytes());
        data
    }

    pub fn sign(keypair: &Keypair) -> Self {
        Self::sign_at(keypair, now_ms())
    }

    fn sign_at(keypair: &Keypair, timestamp_ms: u64) -> Self {
        let identity = keypair.identity();
        let payload = Self::signed_payload(&identity, timestamp_ms);
        Self {
            identity,
            timestamp_ms,
            signature: sign_with_domain(keypair, RELAY_RESERVE_SIGNATURE_DOMAIN, &payload),
        }
    }

    pub fn verify(&self, window: Duration) -> Result<(), FreshnessError> {
        let payload = Self::signed_payload(&self.identity, self.timestamp_ms);
        verify_with_domain(&self.identity, RELAY_RESERVE_SIGNATURE_DOMAIN, &payload, &self.signature)
            .map_err(|_| FreshnessError::SignatureInvalid)?;

        check_timestamp(self.timestamp_ms, window, now_ms())
    }
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum RelayCommand {
    Reserve {
        identity: Identity,
        timestamp_ms: u64,
        notify: mpsc::Sender<SessionId>,
        reply: oneshot::Sender<Option<u64>>,
    },
    Unreserve {
        identity: Identity,
        token: u64,
    },
    Connect {
        target: Identity,
        reply: oneshot::Sender<Result<(SessionId, oneshot::Receiver<TcpStream>), u8>>,
    },
    Accept {
        session: SessionId,
        reply: oneshot::Sender<Option<oneshot::Sender<TcpStream>>>,
    },
    Expire {
        session: SessionId,
    },
    ReservationCount {
        reply: oneshot::Sender<usize>,
    },
    Quit,
}

// ============================================================================
// RelayServer Handle (public API - cheap to clone)
// ============================================================================

/// Handle to the relay server actor. Cheap to clone.
///
/// Attach it to a transport with
/// [`TcpTransport::with_relay_server`](crate::transport::TcpTransport::with_relay_server);
/// relay preambles arriving on that transport's listeners are routed here.
#[derive(Clone)]
pub struct RelayServer {
    cmd_tx: mpsc::Sender<RelayCommand>,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("closed", &self.cmd_tx.is_closed())
            .finish()
    }
}

impl RelayServer {
    pub fn spawn() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        tokio::spawn(RelayServerActor::new().run(cmd_rx));
        info!("relay server started");
        Self { cmd_tx }
    }

    pub async fn reservation_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RelayCommand::ReservationCount { reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RelayCommand::Quit).await;
    }

    /// Serve one relay request on a freshly accepted socket.
    pub(crate) async fn handle(self, stream: TcpStream, preamble: Preamble, peer: SocketAddr) {
        match preamble {
            Preamble::Reserve(request) => self.serve_reservation(stream, request, peer).await,
            Preamble::Connect { target } => self.serve_connect(stream, target, peer).await,
            Preamble::Accept { session } => self.serve_accept(stream, session, peer).await,
            Preamble::Direct => trace!(peer = %peer, "direct connection routed to relay, ignoring"),
        }
    }

    async fn serve_reservation(&self, mut stream: TcpStream, request: ReserveRequest, peer: SocketAddr) {
        if let Err(e) = request.verify(RESERVATION_FRESHNESS) {
            warn!(peer = %peer, error = %e, "rejecting relay reservation");
            let _ = stream.write_all(&[STATUS_REJECTED]).await;
            return;
        }

        let identity = request.identity;
        let (notify_tx, mut notify_rx) = mpsc::channel(16);
        let (reply, rx) = oneshot::channel();
        let sent = self
            .cmd_tx
            .send(RelayCommand::Reserve {
                identity,
                timestamp_ms: request.timestamp_ms,
                notify: notify_tx,
                reply,
            })
            .await;
        let token = match (sent, rx.await) {
            (Ok(()), Ok(Some(token))) => token,
            _ => {
                let _ = stream.write_all(&[STATUS_REJECTED]).await;
                return;
            }
        };
        if stream.write_all(&[STATUS_OK]).await.is_err() {
            let _ = self.cmd_tx.send(RelayCommand::Unreserve { identity, token }).await;
            return;
        }
        debug!(peer = %identity.short(), addr = %peer, "relay reservation accepted");

        let (mut reader, mut writer) = stream.into_split();
        let mut scratch = [0u8; 64];
        loop {
            tokio::select! {
                session = notify_rx.recv() => {
                    let Some(session) = session else { break };
                    let mut msg = Vec::with_capacity(17);
                    msg.push(INCOMING_TAG);
                    msg.extend_from_slice(&session);
                    if writer.write_all(&msg).await.is_err() {
                        break;
                    }
                }
                read = reader.read(&mut scratch) => {
                    if matches!(read, Ok(0) | Err(_)) {
                        break;
                    }
                }
            }
        }

        debug!(peer = %identity.short(), "relay reservation ended");
        let _ = self.cmd_tx.send(RelayCommand::Unreserve { identity, token }).await;
    }

    async fn serve_connect(&self, mut stream: TcpStream, target: Identity, peer: SocketAddr) {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RelayCommand::Connect { target, reply })
            .await
            .is_err()
        {
            return;
        }
        let (session, accepted) = match rx.await {
            Ok(Ok(pending)) => pending,
            Ok(Err(status)) => {
                debug!(addr = %peer, dest = %target.short(), status, "refusing circuit");
                let _ = stream.write_all(&[status]).await;
                return;
            }
            Err(_) => return,
        };

        let mut target_stream = match tokio::time::timeout(RELAY_ACCEPT_TIMEOUT, accepted).await {
            Ok(Ok(target_stream)) => target_stream,
            _ => {
                let _ = self.cmd_tx.send(RelayCommand::Expire { session }).await;
                debug!(addr = %peer, dest = %target.short(), "circuit not accepted in time");
                let _ = stream.write_all(&[STATUS_TIMEOUT]).await;
                return;
            }
        };

        if stream.write_all(&[STATUS_OK]).await.is_err() || target_stream.write_all(&[STATUS_OK]).await.is_err() {
            return;
        }
        debug!(addr = %peer, dest = %target.short(), session = %hex::encode(&session[..4]), "circuit spliced");
        match tokio::io::copy_bidirectional(&mut stream, &mut target_stream).await {
            Ok((up, down)) => trace!(up, down, "circuit finished"),
            Err(e) => trace!(error = %e, "circuit ended with error"),
        }
    }

    async fn serve_accept(&self, mut stream: TcpStream, session: SessionId, peer: SocketAddr) {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RelayCommand::Accept { session, reply })
            .await
            .is_err()
        {
            return;
        }
        match rx.await {
            Ok(Some(waiting)) => {
                // A dialer that already gave up drops the stream.
                let _ = waiting.send(stream);
            }
            _ => {
                debug!(addr = %peer, "accept for unknown circuit");
                let _ = stream.write_all(&[STATUS_REJECTED]).await;
            }
        }
    }
}

// ============================================================================
// RelayServer Actor (owns all state, processes commands sequentially)
// ============================================================================

struct Reservation {
    token: u64,
    timestamp_ms: u64,
    notify: mpsc::Sender<SessionId>,
}

struct PendingCircuit {
    target: Identity,
    created: Instant,
    accepted: oneshot::Sender<TcpStream>,
}

struct RelayServerActor {
    reservations: HashMap<Identity, Reservation>,
    pending: LruCache<SessionId, PendingCircuit>,
    next_token: u64,
}

impl RelayServerActor {
    fn new() -> Self {
        let cap = NonZeroUsize::new(MAX_PENDING_CIRCUITS).expect("MAX_PENDING_CIRCUITS must be non-zero");
        Self {
            reservations: HashMap::new(),
            pending: LruCache::new(cap),
            next_token: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RelayCommand>) {
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RelayCommand::Reserve { identity, timestamp_ms, notify, reply }) => {
                            let _ = reply.send(self.reserve(identity, timestamp_ms, notify));
                        }
                        Some(RelayCommand::Unreserve { identity, token }) => {
                            if self.reservations.get(&identity).is_some_and(|r| r.token == token) {
                                self.reservations.remove(&identity);
                            }
                        }
                        Some(RelayCommand::Connect { target, reply }) => {
                            let _ = reply.send(self.connect(target));
                        }
                        Some(RelayCommand::Accept { session, reply }) => {
                            let waiting = self.pending.pop(&session).map(|p| p.accepted);
                            let _ = reply.send(waiting);
                        }
                        Some(RelayCommand::Expire { session }) => {
                            self.pending.pop(&session);
                        }
                        Some(RelayCommand::ReservationCount { reply }) => {
                            let _ = reply.send(self.reservations.len());
                        }
                        Some(RelayCommand::Quit) | None => {
                            debug!("relay actor shutting down");
                            break;
                        }
                    }
                }
                _ = cleanup.tick() => self.cleanup_expired(),
            }
        }
    }

    fn reserve(&mut self, identity: Identity, timestamp_ms: u64, notify: mpsc::Sender<SessionId>) -> Option<u64> {
        match self.reservations.get(&identity) {
            // Only a newer request may take over a live reservation.
            Some(existing) if timestamp_ms <= existing.timestamp_ms => {
                warn!(peer = %identity.short(), "replayed or outdated reservation request");
                return None;
            }
            None if self.reservations.len() >= MAX_RESERVATIONS => {
                warn!(peer = %identity.short(), "reservation table full");
                return None;
            }
            _ => {}
        }
        self.next_token += 1;
        let token = self.next_token;
        // Replacing drops the previous notify sender, which ends that connection.
        self.reservations.insert(
            identity,
            Reservation {
                token,
                timestamp_ms,
                notify,
            },
        );
        Some(token)
    }

    fn connect(&mut self, target: Identity) -> Result<(SessionId, oneshot::Receiver<TcpStream>), u8> {
        let Some(reservation) = self.reservations.get(&target) else {
            return Err(STATUS_NO_RESERVATION);
        };
        let mut session = [0u8; 16];
        getrandom::getrandom(&mut session).map_err(|_| STATUS_REJECTED)?;
        if reservation.notify.try_send(session).is_err() {
            return Err(STATUS_REJECTED);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.put(
            session,
            PendingCircuit {
                target,
                created: Instant::now(),
                accepted: tx,
            },
        );
        Ok((session, rx))
    }

    fn cleanup_expired(&mut self) {
        let expired: Vec<SessionId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.created.elapsed() > RELAY_ACCEPT_TIMEOUT * 2)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(p) = self.pending.pop(&id) {
                trace!(dest = %p.target.short(), "dropping stale pending circuit");
            }
        }
        self.reservations.retain(|_, r| !r.notify.is_closed());
    }
}

// ============================================================================
// RelayClient (runs on peers that want to be reachable through relays)
// ============================================================================

/// Keeps reservations alive on a set of relays.
///
/// Accepted circuits are delivered to the `inbound` channel given to
/// [`RelayClient::spawn`], next to directly accepted connections. Dropping
/// the client releases all reservations.
pub struct RelayClient {
    circuits: Arc<RwLock<Vec<PeerAddr>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayClient {
    /// `relays` must be direct addresses carrying the relay identity.
    pub fn spawn(
        keypair: Keypair,
        relays: Vec<PeerAddr>,
        retry: RetryPolicy,
        inbound: mpsc::Sender<RawConnection>,
    ) -> Self {
        let circuits = Arc::new(RwLock::new(Vec::new()));
        let tasks = relays
            .into_iter()
            .filter_map(|addr| match addr {
                PeerAddr::Direct { socket, peer: Some(relay_id) } => Some((socket, relay_id)),
                other => {
                    warn!(addr = %other, "relay address needs a relay identity, skipping");
                    None
                }
            })
            .map(|(relay, relay_id)| {
                let circuit = PeerAddr::Circuit {
                    relay,
                    relay_id,
                    target: keypair.identity(),
                };
                tokio::spawn(hold_reservation(
                    keypair.clone(),
                    relay,
                    circuit,
                    retry.clone(),
                    circuits.clone(),
                    inbound.clone(),
                ))
            })
            .collect();
        Self { circuits, tasks }
    }

    /// Circuit addresses of the reservations currently held.
    pub fn circuit_addrs(&self) -> Vec<PeerAddr> {
        self.circuits.read().map(|c| c.clone()).unwrap_or_default()
    }

    /// Shared view of the active circuit addresses, for address advertisement.
    pub(crate) fn circuits(&self) -> Arc<RwLock<Vec<PeerAddr>>> {
        self.circuits.clone()
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Ok(mut circuits) = self.circuits.write() {
            circuits.clear();
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn set_circuit(circuits: &RwLock<Vec<PeerAddr>>, circuit: &PeerAddr, active: bool) {
    if let Ok(mut list) = circuits.write() {
        list.retain(|c| c != circuit);
        if active {
            list.push(circuit.clone());
        }
    }
}

async fn hold_reservation(
    keypair: Keypair,
    relay: SocketAddr,
    circuit: PeerAddr,
    retry: RetryPolicy,
    circuits: Arc<RwLock<Vec<PeerAddr>>>,
    inbound: mpsc::Sender<RawConnection>,
) {
    let mut backoff = retry.initial_backoff;
    loop {
        match reserve(&keypair, relay).await {
            Ok(stream) => {
                info!(relay = %relay, addr = %circuit, "relay reservation active");
                backoff = retry.initial_backoff;
                set_circuit(&circuits, &circuit, true);
                serve_incoming(stream, relay, &inbound).await;
                set_circuit(&circuits, &circuit, false);
                debug!(relay = %relay, "relay reservation lost");
            }
            Err(e) => debug!(relay = %relay, error = %e, "relay reservation failed"),
        }
        if inbound.is_closed() {
            return;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(retry.max_backoff);
    }
}

async fn reserve(keypair: &Keypair, relay: SocketAddr) -> Result<TcpStream, TransportError> {
    let preamble = Preamble::Reserve(ReserveRequest::sign(keypair));
    let mut stream = connect_relay(relay, &preamble).await?;
    match read_status(&mut stream, PREAMBLE_TIMEOUT).await? {
        STATUS_OK => Ok(stream),
        status => Err(status_error(status)),
    }
}

async fn serve_incoming(mut stream: TcpStream, relay: SocketAddr, inbound: &mpsc::Sender<RawConnection>) {
    loop {
        let mut tag = [0u8; 1];
        if stream.read_exact(&mut tag).await.is_err() {
            return;
        }
        if tag[0] != INCOMING_TAG {
            warn!(relay = %relay, tag = tag[0], "unexpected message on reservation");
            return;
        }
        let mut session = [0u8; 16];
        if stream.read_exact(&mut session).await.is_err() {
            return;
        }
        let inbound = inbound.clone();
        tokio::spawn(async move {
            match accept_circuit(relay, session).await {
                Ok(stream) => {
                    let conn = RawConnection::new(stream, PeerAddr::direct(relay), "relay");
                    let _ = inbound.send(conn).await;
                }
                Err(e) => debug!(relay = %relay, error = %e, "failed to accept relayed circuit"),
            }
        });
    }
}

async fn accept_circuit(relay: SocketAddr, session: SessionId) -> Result<TcpStream, TransportError> {
    let mut stream = connect_relay(relay, &Preamble::Accept { session }).await?;
    match read_status(&mut stream, RELAY_ACCEPT_TIMEOUT).await? {
        STATUS_OK => Ok(stream),
        status => Err(status_error(status)),
    }
}
