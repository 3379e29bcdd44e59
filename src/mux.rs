//! # Stream Multiplexer
//!
//! Carries many independent byte streams over one secure channel.
//!
//! ## Frames
//!
//! One mux frame per secure frame:
//!
//! ```text
//! kind(1) || varint stream_id || varint length || payload
//! ```
//!
//! | Kind | Meaning |
//! |------|---------|
//! | OPEN | new stream, payload is the protocol id |
//! | DATA | stream bytes |
//! | WINDOW | grant `varint` more bytes of send credit |
//! | CLOSE | sender will write no more (half-close) |
//! | RESET | abort the stream in both directions |
//! | GOAWAY | sender is shutting the connection down |
//!
//! ## Flow Control
//!
//! Every stream starts with `initial_window` bytes of credit in each
//! direction. [`Stream::send`] waits on a credit semaphore; the receiver
//! returns credit with WINDOW frames as the application consumes data.
//! Exceeding the advertised window resets the stream.
//!
//! ## Actor Layout
//!
//! ```text
//!  reader task ──frames──► MuxActor ──frames──► writer task
//!                             ▲  │
//!               MuxConnection │  │ Stream buffers
//!                    Stream ──┘  ▼
//! ```
//!
//! The actor owns the stream table. Streams write DATA straight to the
//! writer queue once they hold credit, so stream bytes stay in send order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::address::PeerAddr;
use crate::error::ProtocolError;
use crate::identity::Identity;
use crate::protocols::{FrameRead, FrameWrite, Multiplexer, Role};
use crate::secure::SecuredConnection;
use crate::wire::{decode_varint, encode_varint};

pub const DEFAULT_INITIAL_WINDOW: u32 = 256 * 1024;
pub const DEFAULT_MAX_STREAMS: usize = 256;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Largest DATA payload per frame.
pub const MAX_DATA_CHUNK: usize = 16 * 1024;

const MAX_PROTOCOL_ID_LEN: usize = 128;

/// Kind byte plus two maximal varints.
const MAX_FRAME_HEADER: usize = 21;
const ACCEPT_BACKLOG: usize = 32;

pub type StreamId = u64;

/// Inbound streams opened by the remote side.
pub type IncomingStreams = mpsc::Receiver<Stream>;

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub initial_window: u32,
    pub max_streams: usize,
    pub idle_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            initial_window: DEFAULT_INITIAL_WINDOW,
            max_streams: DEFAULT_MAX_STREAMS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameKind {
    Open = 0,
    Data = 1,
    Window = 2,
    Close = 3,
    Reset = 4,
    GoAway = 5,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0 => FrameKind::Open,
            1 => FrameKind::Data,
            2 => FrameKind::Window,
            3 => FrameKind::Close,
            4 => FrameKind::Reset,
            5 => FrameKind::GoAway,
            other => return Err(ProtocolError::UnknownFrameType(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MuxFrame {
    kind: FrameKind,
    stream: StreamId,
    payload: Vec<u8>,
}

impl MuxFrame {
    fn new(kind: FrameKind, stream: StreamId, payload: Vec<u8>) -> Self {
        Self { kind, stream, payload }
    }

    fn window(stream: StreamId, credit: u64) -> Self {
        let mut payload = Vec::with_capacity(10);
        encode_varint(credit, &mut payload);
        Self::new(FrameKind::Window, stream, payload)
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + MAX_FRAME_HEADER);
        out.push(self.kind as u8);
        encode_varint(self.stream, &mut out);
        encode_varint(self.payload.len() as u64, &mut out);
        out.extend_from_slice(&self.payload);
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let truncated = || ProtocolError::Decode("truncated mux frame".into());
        let (&kind, rest) = buf.split_first().ok_or_else(truncated)?;
        let kind = FrameKind::try_from(kind)?;
        let (stream, used) = decode_varint(rest)?.ok_or_else(truncated)?;
        let rest = &rest[used..];
        let (len, used) = decode_varint(rest)?.ok_or_else(truncated)?;
        let rest = &rest[used..];
        if rest.len() as u64 != len {
            return Err(ProtocolError::Decode("mux frame length mismatch".into()));
        }
        Ok(Self::new(kind, stream, rest.to_vec()))
    }

    fn credit(&self) -> Result<u64, ProtocolError> {
        match decode_varint(&self.payload)? {
            Some((credit, used)) if used == self.payload.len() => Ok(credit),
            _ => Err(ProtocolError::Decode("malformed window update".into())),
        }
    }
}

enum Command {
    Open {
        protocol: String,
        reply: oneshot::Sender<Result<Stream, ProtocolError>>,
    },
    Consumed {
        stream: StreamId,
        bytes: usize,
    },
    LocalClose(StreamId),
    Dropped(StreamId),
    GoAway(Duration),
    Abort,
}

/// A logical duplex byte channel inside a [`MuxConnection`].
pub struct Stream {
    id: StreamId,
    protocol: String,
    remote: Identity,
    max_chunk: usize,
    credit: Arc<Semaphore>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    writer: mpsc::UnboundedSender<MuxFrame>,
    commands: mpsc::UnboundedSender<Command>,
    local_closed: bool,
    remote_finished: bool,
}

impl Stream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn remote(&self) -> Identity {
        self.remote
    }

    /// Send `data`, waiting for window credit as needed.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if self.local_closed {
            return Err(ProtocolError::StreamClosed);
        }
        for chunk in data.chunks(self.max_chunk) {
            let permit = self
                .credit
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| ProtocolError::StreamReset)?;
            permit.forget();
            self.writer
                .send(MuxFrame::new(FrameKind::Data, self.id, chunk.to_vec()))
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Next chunk from the remote, in send order. `None` once the remote
    /// half-closed, reset the stream, or the connection ended.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        match self.inbound.recv().await {
            Some(chunk) => {
                let _ = self.commands.send(Command::Consumed {
                    stream: self.id,
                    bytes: chunk.len(),
                });
                Some(chunk)
            }
            None => {
                self.remote_finished = true;
                None
            }
        }
    }

    /// Half-close: no more data will be sent on this stream.
    pub fn close(&mut self) {
        if self.local_closed {
            return;
        }
        self.local_closed = true;
        let _ = self.writer.send(MuxFrame::new(FrameKind::Close, self.id, Vec::new()));
        let _ = self.commands.send(Command::LocalClose(self.id));
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.local_closed && self.remote_finished {
            return;
        }
        let _ = self.writer.send(MuxFrame::new(FrameKind::Reset, self.id, Vec::new()));
        let _ = self.commands.send(Command::Dropped(self.id));
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Handle to a multiplexed connection. Cheap to clone.
#[derive(Clone)]
pub struct MuxConnection {
    remote: Identity,
    remote_addr: PeerAddr,
    role: Role,
    commands: mpsc::UnboundedSender<Command>,
    closed: watch::Receiver<bool>,
}

impl MuxConnection {
    pub fn remote(&self) -> Identity {
        self.remote
    }

    pub fn remote_addr(&self) -> &PeerAddr {
        &self.remote_addr
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn open_stream(&self, protocol: &str, deadline: Instant) -> Result<Stream, ProtocolError> {
        if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_ID_LEN {
            return Err(ProtocolError::Decode(format!("invalid protocol id {protocol:?}")));
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Open {
                protocol: protocol.to_string(),
                reply: tx,
            })
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    /// Send GOAWAY and wait until the remote acknowledges or `grace` passes.
    pub async fn close(&self, grace: Duration) {
        if self.commands.send(Command::GoAway(grace)).is_err() {
            return;
        }
        self.closed().await;
    }

    /// Tear the connection down immediately.
    pub fn abort(&self) {
        let _ = self.commands.send(Command::Abort);
    }

    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl std::fmt::Debug for MuxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConnection")
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The standard [`Multiplexer`].
#[derive(Debug, Clone, Default)]
pub struct FrameMux {
    config: MuxConfig,
}

impl FrameMux {
    pub fn new(config: MuxConfig) -> Self {
        Self { config }
    }
}

impl Multiplexer for FrameMux {
    fn multiplex(&self, conn: SecuredConnection, role: Role) -> (MuxConnection, IncomingStreams) {
        spawn(conn, role, self.config.clone())
    }
}

/// Start the reader, writer and actor tasks for `conn`.
pub fn spawn(conn: SecuredConnection, role: Role, config: MuxConfig) -> (MuxConnection, IncomingStreams) {
    let SecuredConnection {
        remote,
        remote_addr,
        reader,
        writer,
        ..
    } = conn;

    // Unbounded: DATA volume is already bounded by the stream windows.
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
    let (closed_tx, closed_rx) = watch::channel(false);

    let max_chunk = MAX_DATA_CHUNK
        .min(config.initial_window.max(1) as usize)
        .min(writer.max_frame_len().saturating_sub(MAX_FRAME_HEADER))
        .max(1);

    let reader_task = tokio::spawn(read_loop(reader, inbound_tx));
    tokio::spawn(write_loop(writer, frame_rx, closed_rx.clone()));
    let actor = MuxActor {
        remote,
        config,
        max_chunk,
        streams: HashMap::new(),
        next_id: match role {
            Role::Initiator => 1,
            Role::Responder => 2,
        },
        role,
        writer: frame_tx,
        commands: cmd_tx.clone(),
        accept_tx,
        local_goaway: false,
        last_activity: Instant::now(),
        grace_deadline: None,
    };
    tokio::spawn(actor.run(cmd_rx, inbound_rx, reader_task, closed_tx));

    (
        MuxConnection {
            remote,
            remote_addr,
            role,
            commands: cmd_tx,
            closed: closed_rx,
        },
        accept_rx,
    )
}

async fn read_loop(mut reader: Box<dyn FrameRead>, tx: mpsc::UnboundedSender<Result<MuxFrame, ProtocolError>>) {
    loop {
        let item = match reader.read_frame().await {
            Ok(Some(bytes)) => MuxFrame::decode(&bytes),
            Ok(None) => return,
            Err(e) => Err(e),
        };
        let failed = item.is_err();
        if tx.send(item).is_err() || failed {
            return;
        }
    }
}

/// Streams hold writer senders, so the queue alone never ends while a
/// stream lives; the actor's `closed` signal flushes and shuts down.
async fn write_loop(
    mut writer: Box<dyn FrameWrite>,
    mut rx: mpsc::UnboundedReceiver<MuxFrame>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => frame,
            _ = closed.wait_for(|c| *c) => None,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = writer.write_frame(&frame.encode()).await {
            debug!(error = %e, "mux write failed");
            return;
        }
    }
    while let Ok(frame) = rx.try_recv() {
        if writer.write_frame(&frame.encode()).await.is_err() {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

struct StreamEntry {
    inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    credit: Arc<Semaphore>,
    recv_remaining: u64,
    local_closed: bool,
    remote_closed: bool,
}

struct MuxActor {
    remote: Identity,
    role: Role,
    config: MuxConfig,
    max_chunk: usize,
    streams: HashMap<StreamId, StreamEntry>,
    next_id: StreamId,
    writer: mpsc::UnboundedSender<MuxFrame>,
    commands: mpsc::UnboundedSender<Command>,
    accept_tx: mpsc::Sender<Stream>,
    local_goaway: bool,
    last_activity: Instant,
    grace_deadline: Option<Instant>,
}

enum Flow {
    Continue,
    Stop,
}

impl MuxActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut inbound_rx: mpsc::UnboundedReceiver<Result<MuxFrame, ProtocolError>>,
        reader_task: JoinHandle<()>,
        closed_tx: watch::Sender<bool>,
    ) {
        let tick = (self.config.idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut maintenance = tokio::time::interval(tick);

        loop {
            let flow = tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => Flow::Stop,
                },
                frame = inbound_rx.recv() => match frame {
                    Some(Ok(frame)) => {
                        self.last_activity = Instant::now();
                        self.handle_frame(frame)
                    }
                    Some(Err(e)) => {
                        warn!(peer = %self.remote.short(), error = %e, "connection failed");
                        Flow::Stop
                    }
                    None => {
                        trace!(peer = %self.remote.short(), "remote closed connection");
                        Flow::Stop
                    }
                },
                _ = maintenance.tick() => self.check_timers(),
            };
            if let Flow::Stop = flow {
                break;
            }
        }

        reader_task.abort();
        for (_, entry) in self.streams.drain() {
            entry.credit.close();
        }
        debug!(peer = %self.remote.short(), role = ?self.role, "connection closed");
        let _ = closed_tx.send(true);
    }

    fn check_timers(&mut self) -> Flow {
        let now = Instant::now();
        if self.writer.is_closed() {
            return Flow::Stop;
        }
        if let Some(deadline) = self.grace_deadline
            && now >= deadline
        {
            debug!(peer = %self.remote.short(), "close grace period elapsed, forcing close");
            return Flow::Stop;
        }
        if self.streams.is_empty() && now.duration_since(self.last_activity) >= self.config.idle_timeout {
            debug!(peer = %self.remote.short(), "idle timeout");
            self.send_goaway();
            return Flow::Stop;
        }
        Flow::Continue
    }

    fn send_goaway(&mut self) {
        if !self.local_goaway {
            self.local_goaway = true;
            let _ = self.writer.send(MuxFrame::new(FrameKind::GoAway, 0, Vec::new()));
        }
    }

    fn new_stream(&mut self, id: StreamId, protocol: String) -> Stream {
        let (tx, rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(self.config.initial_window as usize));
        self.streams.insert(
            id,
            StreamEntry {
                inbound: Some(tx),
                credit: credit.clone(),
                recv_remaining: u64::from(self.config.initial_window),
                local_closed: false,
                remote_closed: false,
            },
        );
        Stream {
            id,
            protocol,
            remote: self.remote,
            max_chunk: self.max_chunk,
            credit,
            inbound: rx,
            writer: self.writer.clone(),
            commands: self.commands.clone(),
            local_closed: false,
            remote_finished: false,
        }
    }

    fn remove_stream(&mut self, id: StreamId) {
        if let Some(entry) = self.streams.remove(&id) {
            entry.credit.close();
        }
    }

    fn reset_stream(&mut self, id: StreamId) {
        self.remove_stream(id);
        let _ = self.writer.send(MuxFrame::new(FrameKind::Reset, id, Vec::new()));
    }

    fn is_remote_id(&self, id: StreamId) -> bool {
        let odd = id % 2 == 1;
        match self.role {
            Role::Initiator => !odd,
            Role::Responder => odd,
        }
    }

    fn handle_command(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Open { protocol, reply } => {
                if self.local_goaway {
                    let _ = reply.send(Err(ProtocolError::ConnectionClosed));
                } else if self.streams.len() >= self.config.max_streams {
                    let _ = reply.send(Err(ProtocolError::TooManyStreams(self.config.max_streams)));
                } else {
                    let id = self.next_id;
                    self.next_id += 2;
                    let _ = self
                        .writer
                        .send(MuxFrame::new(FrameKind::Open, id, protocol.as_bytes().to_vec()));
                    let stream = self.new_stream(id, protocol);
                    trace!(peer = %self.remote.short(), stream = id, "opened stream");
                    // A caller that gave up drops the stream, which resets it.
                    let _ = reply.send(Ok(stream));
                }
            }
            Command::Consumed { stream, bytes } => {
                if let Some(entry) = self.streams.get_mut(&stream)
                    && !entry.remote_closed
                {
                    entry.recv_remaining += bytes as u64;
                    let _ = self.writer.send(MuxFrame::window(stream, bytes as u64));
                }
            }
            Command::LocalClose(id) => {
                if let Some(entry) = self.streams.get_mut(&id) {
                    entry.local_closed = true;
                    if entry.remote_closed {
                        self.remove_stream(id);
                    }
                }
            }
            Command::Dropped(id) => self.remove_stream(id),
            Command::GoAway(grace) => {
                self.send_goaway();
                let deadline = Instant::now() + grace;
                self.grace_deadline = Some(self.grace_deadline.map_or(deadline, |d| d.min(deadline)));
            }
            Command::Abort => return Flow::Stop,
        }
        Flow::Continue
    }

    fn handle_frame(&mut self, frame: MuxFrame) -> Flow {
        let id = frame.stream;
        match frame.kind {
            FrameKind::Open => {
                let protocol = match String::from_utf8(frame.payload) {
                    Ok(p) if !p.is_empty() && p.len() <= MAX_PROTOCOL_ID_LEN => p,
                    _ => {
                        self.reset_stream(id);
                        return Flow::Continue;
                    }
                };
                if self.local_goaway
                    || !self.is_remote_id(id)
                    || self.streams.contains_key(&id)
                    || self.streams.len() >= self.config.max_streams
                {
                    debug!(peer = %self.remote.short(), stream = id, "refusing inbound stream");
                    let _ = self.writer.send(MuxFrame::new(FrameKind::Reset, id, Vec::new()));
                    return Flow::Continue;
                }
                let stream = self.new_stream(id, protocol);
                if let Err(e) = self.accept_tx.try_send(stream) {
                    debug!(peer = %self.remote.short(), stream = id, "accept queue unavailable, resetting");
                    // The rejected stream resets itself on drop.
                    drop(e);
                }
            }
            FrameKind::Data => {
                let Some(entry) = self.streams.get_mut(&id) else {
                    return Flow::Continue;
                };
                let len = frame.payload.len() as u64;
                if entry.remote_closed || len > entry.recv_remaining {
                    warn!(
                        peer = %self.remote.short(),
                        error = %ProtocolError::FlowControl { stream: id },
                        "resetting stream"
                    );
                    self.reset_stream(id);
                    return Flow::Continue;
                }
                entry.recv_remaining -= len;
                if let Some(inbound) = &entry.inbound {
                    let _ = inbound.send(frame.payload);
                }
            }
            FrameKind::Window => match frame.credit() {
                Ok(credit) => {
                    if let Some(entry) = self.streams.get(&id) {
                        let available = entry.credit.available_permits() as u64;
                        if credit > (Semaphore::MAX_PERMITS as u64).saturating_sub(available) {
                            warn!(
                                peer = %self.remote.short(),
                                error = %ProtocolError::FlowControl { stream: id },
                                "window credit overflow, resetting stream"
                            );
                            self.reset_stream(id);
                        } else {
                            entry.credit.add_permits(credit as usize);
                        }
                    }
                }
                Err(e) => {
                    warn!(peer = %self.remote.short(), error = %e, "bad window update");
                    return Flow::Stop;
                }
            },
            FrameKind::Close => {
                if let Some(entry) = self.streams.get_mut(&id) {
                    entry.remote_closed = true;
                    entry.inbound = None;
                    if entry.local_closed {
                        self.remove_stream(id);
                    }
                }
            }
            FrameKind::Reset => self.remove_stream(id),
            FrameKind::GoAway => {
                trace!(peer = %self.remote.short(), "received GOAWAY");
                self.send_goaway();
                return Flow::Stop;
            }
        }
        Flow::Continue
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::protocols::SecureChannel;
    use crate::secure::Negotiator;
    use crate::transport::RawConnection;

    pub(crate) async fn secured_pair() -> (SecuredConnection, SecuredConnection) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let addr = PeerAddr::direct("127.0.0.1:9".parse().unwrap());
        let alice = Negotiator::new(Keypair::generate());
        let bob = Negotiator::new(Keypair::generate());
        let (a, b) = tokio::join!(
            alice.secure(RawConnection::new(a, addr.clone(), "memory"), Role::Initiator, None),
            bob.secure(RawConnection::new(b, addr, "memory"), Role::Responder, None)
        );
        (a.unwrap(), b.unwrap())
    }

    async fn mux_pair(config: MuxConfig) -> ((MuxConnection, IncomingStreams), (MuxConnection, IncomingStreams)) {
        let (a, b) = secured_pair().await;
        (
            spawn(a, Role::Initiator, config.clone()),
            spawn(b, Role::Responder, config),
        )
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    async fn read_exact(stream: &mut Stream, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            match tokio::time::timeout(Duration::from_secs(5), stream.recv()).await {
                Ok(Some(chunk)) => out.extend_from_slice(&chunk),
                other => panic!("stream ended early: {other:?}"),
            }
        }
        out
    }

    #[test]
    fn frame_layout() {
        let frame = MuxFrame::new(FrameKind::Data, 300, b"abc".to_vec());
        let bytes = frame.encode();
        assert_eq!(bytes[0], FrameKind::Data as u8);
        assert_eq!(MuxFrame::decode(&bytes).unwrap(), frame);

        let window = MuxFrame::window(7, 65_536);
        assert_eq!(MuxFrame::decode(&window.encode()).unwrap().credit().unwrap(), 65_536);
    }

    #[test]
    fn frame_length_mismatch_is_rejected() {
        let mut bytes = MuxFrame::new(FrameKind::Data, 1, b"abc".to_vec()).encode();
        bytes.push(0);
        assert!(MuxFrame::decode(&bytes).is_err());
        assert!(matches!(
            MuxFrame::decode(&[9, 1, 0]),
            Err(ProtocolError::UnknownFrameType(9))
        ));
    }

    #[tokio::test]
    async fn open_send_and_accept() {
        let ((a, _a_in), (_b, mut b_in)) = mux_pair(MuxConfig::default()).await;

        let mut outbound = a.open_stream("/test/1.0.0", soon()).await.unwrap();
        assert_eq!(outbound.id() % 2, 1, "initiator streams are odd");
        outbound.send(b"hello").await.unwrap();
        outbound.send(b" world").await.unwrap();

        let mut inbound = b_in.recv().await.expect("accepted stream");
        assert_eq!(inbound.protocol(), "/test/1.0.0");
        assert_eq!(inbound.id(), outbound.id());
        assert_eq!(read_exact(&mut inbound, 11).await, b"hello world");
    }

    #[tokio::test]
    async fn streams_are_independent_and_ordered() {
        let ((a, mut a_in), (b, mut b_in)) = mux_pair(MuxConfig::default()).await;

        let mut s1 = a.open_stream("/one", soon()).await.unwrap();
        let mut s2 = b.open_stream("/two", soon()).await.unwrap();
        assert_eq!(s2.id() % 2, 0, "responder streams are even");

        let big: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        s1.send(&big).await.unwrap();
        s2.send(b"from b").await.unwrap();

        let mut r1 = b_in.recv().await.unwrap();
        let mut r2 = a_in.recv().await.unwrap();
        assert_eq!(read_exact(&mut r2, 6).await, b"from b");
        assert_eq!(read_exact(&mut r1, big.len()).await, big);
    }

    #[tokio::test]
    async fn sender_blocks_until_window_is_returned() {
        let config = MuxConfig {
            initial_window: 1024,
            ..MuxConfig::default()
        };
        let ((a, _a_in), (_b, mut b_in)) = mux_pair(config).await;
        let mut outbound = a.open_stream("/flow", soon()).await.unwrap();

        let sender = tokio::spawn(async move {
            outbound.send(&[7u8; 4096]).await.unwrap();
            outbound
        });

        let mut inbound = b_in.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sender.is_finished(), "send must wait for window credit");

        let data = read_exact(&mut inbound, 4096).await;
        assert_eq!(data.len(), 4096);
        let _outbound = tokio::time::timeout(Duration::from_secs(5), sender)
            .await
            .expect("sender finished")
            .unwrap();
    }

    #[tokio::test]
    async fn half_close_keeps_other_direction_open() {
        let ((a, _a_in), (_b, mut b_in)) = mux_pair(MuxConfig::default()).await;
        let mut outbound = a.open_stream("/half", soon()).await.unwrap();
        outbound.send(b"request").await.unwrap();
        outbound.close();
        assert!(matches!(outbound.send(b"more").await, Err(ProtocolError::StreamClosed)));

        let mut inbound = b_in.recv().await.unwrap();
        assert_eq!(read_exact(&mut inbound, 7).await, b"request");
        assert!(inbound.recv().await.is_none());

        inbound.send(b"response").await.unwrap();
        inbound.close();
        assert_eq!(read_exact(&mut outbound, 8).await, b"response");
        assert!(outbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_stream_resets_peer() {
        let config = MuxConfig {
            initial_window: 1024,
            ..MuxConfig::default()
        };
        let ((a, _a_in), (_b, mut b_in)) = mux_pair(config).await;
        let mut outbound = a.open_stream("/reset", soon()).await.unwrap();
        outbound.send(b"x").await.unwrap();

        let inbound = b_in.recv().await.unwrap();
        drop(inbound);

        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Err(e) = outbound.send(&[0u8; 512]).await {
                    return e;
                }
            }
        })
        .await
        .expect("send fails after reset");
        assert!(matches!(result, ProtocolError::StreamReset));
        assert!(outbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn goaway_closes_both_sides() {
        let ((a, _a_in), (b, mut b_in)) = mux_pair(MuxConfig::default()).await;
        let mut outbound = a.open_stream("/bye", soon()).await.unwrap();
        outbound.send(b"x").await.unwrap();
        let mut inbound = b_in.recv().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), a.close(Duration::from_secs(2)))
            .await
            .expect("close completes");
        tokio::time::timeout(Duration::from_secs(5), b.closed())
            .await
            .expect("remote observes close");
        assert!(a.is_closed() && b.is_closed());

        assert_eq!(read_exact(&mut inbound, 1).await, b"x");
        assert!(inbound.recv().await.is_none());
        assert!(matches!(
            a.open_stream("/late", soon()).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn idle_connection_times_out() {
        let config = MuxConfig {
            idle_timeout: Duration::from_millis(100),
            ..MuxConfig::default()
        };
        let ((a, _a_in), (b, _b_in)) = mux_pair(config).await;
        tokio::time::timeout(Duration::from_secs(5), a.closed())
            .await
            .expect("idle close");
        tokio::time::timeout(Duration::from_secs(5), b.closed())
            .await
            .expect("idle close");
    }

    #[tokio::test]
    async fn expired_deadline_is_timeout() {
        let ((a, _a_in), (_b, _b_in)) = mux_pair(MuxConfig::default()).await;
        let past = Instant::now() - Duration::from_millis(1);
        assert!(matches!(a.open_stream("/late", past).await, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn stream_limit_is_enforced() {
        let config = MuxConfig {
            max_streams: 2,
            ..MuxConfig::default()
        };
        let ((a, _a_in), (_b, _b_in)) = mux_pair(config).await;
        let _s1 = a.open_stream("/a", soon()).await.unwrap();
        let _s2 = a.open_stream("/b", soon()).await.unwrap();
        assert!(matches!(
            a.open_stream("/c", soon()).await,
            Err(ProtocolError::TooManyStreams(2))
        ));
    }

    async fn next_frame_of(conn: &mut SecuredConnection, kind: FrameKind) -> MuxFrame {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let bytes = conn.reader.read_frame().await.unwrap().expect("connection open");
                let frame = MuxFrame::decode(&bytes).unwrap();
                if frame.kind == kind {
                    return frame;
                }
            }
        })
        .await
        .expect("frame arrives")
    }

    #[tokio::test]
    async fn window_overflow_resets_only_that_stream() {
        let (a, mut raw) = secured_pair().await;
        let (a, _a_in) = spawn(a, Role::Initiator, MuxConfig::default());

        let _stream = a.open_stream("/window", soon()).await.unwrap();
        let open = next_frame_of(&mut raw, FrameKind::Open).await;
        raw.writer
            .write_frame(&MuxFrame::window(open.stream, u64::MAX).encode())
            .await
            .unwrap();

        let reset = next_frame_of(&mut raw, FrameKind::Reset).await;
        assert_eq!(reset.stream, open.stream);
        assert!(!a.is_closed());
        let next = a.open_stream("/after", soon()).await.unwrap();
        assert_ne!(next.id(), open.stream);
    }

    /// Writer with a small frame limit, to check DATA chunking respects it.
    struct SmallFrames {
        inner: Box<dyn crate::protocols::FrameWrite>,
    }

    #[async_trait::async_trait]
    impl crate::protocols::FrameWrite for SmallFrames {
        async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
            assert!(frame.len() <= 64, "frame of {} bytes exceeds limit", frame.len());
            self.inner.write_frame(frame).await
        }

        async fn shutdown(&mut self) -> Result<(), ProtocolError> {
            self.inner.shutdown().await
        }

        fn max_frame_len(&self) -> usize {
            64
        }
    }

    #[tokio::test]
    async fn data_chunks_fit_the_writer_frame_limit() {
        let (mut a, b) = secured_pair().await;
        a.writer = Box::new(SmallFrames { inner: a.writer });
        let (a, _a_in) = spawn(a, Role::Initiator, MuxConfig::default());
        let (_b, mut b_in) = spawn(b, Role::Responder, MuxConfig::default());

        let mut outbound = a.open_stream("/small", soon()).await.unwrap();
        let payload = vec![7u8; 1000];
        outbound.send(&payload).await.unwrap();
        let mut inbound = b_in.recv().await.unwrap();
        assert_eq!(read_exact(&mut inbound, payload.len()).await, payload);
    }

    #[tokio::test]
    async fn transport_failure_ends_streams() {
        let ((a, _a_in), (b, mut b_in)) = mux_pair(MuxConfig::default()).await;
        let mut outbound = a.open_stream("/x", soon()).await.unwrap();
        outbound.send(b"1").await.unwrap();
        let mut inbound = b_in.recv().await.unwrap();
        assert_eq!(read_exact(&mut inbound, 1).await, b"1");

        a.abort();
        tokio::time::timeout(Duration::from_secs(5), b.closed())
            .await
            .expect("remote notices");
        assert!(inbound.recv().await.is_none());
    }
}
