//! # Secure Channel Negotiation
//!
//! Turns a raw byte stream into an authenticated, encrypted frame channel
//! bound to the remote peer's long-term Ed25519 identity.
//!
//! ## Handshake
//!
//! ```text
//! I → R   version || e_I
//! R → I   version || e_R || seal(k_R, id_R || sig_R)
//! I → R   seal(k_I, id_I || sig_I)
//! ```
//!
//! `e_*` are fresh X25519 keys, `h = blake3(e_I || e_R)` is the transcript
//! hash and `sig_X` signs `h || role` under the handshake domain. Each side
//! proves possession of its identity key over this very key exchange, so a
//! relay or man in the middle cannot splice two sessions together.
//!
//! ## Frames
//!
//! After the handshake each direction has its own ChaCha20-Poly1305 key.
//! Frames are `u16 BE length || ciphertext || tag` and the nonce is an
//! implicit per-direction counter.

use std::io;

use async_trait::async_trait;
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::address::PeerAddr;
use crate::crypto::{
    AEAD_TAG_LEN, CipherState, HANDSHAKE_SIGNATURE_DOMAIN, KDF_HANDSHAKE_INITIATOR, KDF_HANDSHAKE_RESPONDER,
    KDF_TRANSPORT_I2R, KDF_TRANSPORT_R2I, derive_key, sign_with_domain, verify_with_domain,
};
use crate::error::{HandshakeError, ProtocolError};
use crate::identity::{Identity, Keypair};
use crate::protocols::{FrameRead, FrameWrite, Role, SecureChannel};
use crate::transport::{BoxedIo, RawConnection};

pub const HANDSHAKE_VERSION: u8 = 1;

/// Largest sealed frame: the u16 length prefix bounds it.
pub const MAX_SEALED_FRAME: usize = u16::MAX as usize;

/// Largest plaintext that fits one sealed frame.
pub const MAX_FRAME_PLAINTEXT: usize = MAX_SEALED_FRAME - AEAD_TAG_LEN;

/// identity(32) || signature(64)
const AUTH_PAYLOAD_LEN: usize = 32 + 64;
const SEALED_AUTH_LEN: usize = AUTH_PAYLOAD_LEN + AEAD_TAG_LEN;

/// An authenticated channel ready for multiplexing.
pub struct SecuredConnection {
    pub local: Identity,
    pub remote: Identity,
    pub remote_addr: PeerAddr,
    pub reader: Box<dyn FrameRead>,
    pub writer: Box<dyn FrameWrite>,
}

impl std::fmt::Debug for SecuredConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuredConnection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("remote_addr", &self.remote_addr.to_string())
            .finish_non_exhaustive()
    }
}

/// The standard [`SecureChannel`]: X25519 key agreement authenticated by
/// Ed25519 identity signatures.
pub struct Negotiator {
    keypair: Keypair,
}

impl Negotiator {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }
}

#[async_trait]
impl SecureChannel for Negotiator {
    async fn secure(
        &self,
        raw: RawConnection,
        role: Role,
        expected: Option<Identity>,
    ) -> Result<SecuredConnection, HandshakeError> {
        let RawConnection { mut io, remote, carrier } = raw;
        let session = match role {
            Role::Initiator => initiate(&self.keypair, &mut io, expected).await?,
            Role::Responder => respond(&self.keypair, &mut io, expected).await?,
        };
        debug!(
            peer = %session.remote.short(),
            addr = %remote,
            carrier,
            ?role,
            "secure channel established"
        );

        let (read_half, write_half) = tokio::io::split(io);
        Ok(SecuredConnection {
            local: self.keypair.identity(),
            remote: session.remote,
            remote_addr: remote,
            reader: Box::new(SecureReader::new(read_half, session.recv)),
            writer: Box::new(SecureWriter::new(write_half, session.send)),
        })
    }
}

struct Session {
    remote: Identity,
    send: CipherState,
    recv: CipherState,
}

fn map_eof(e: io::Error) -> HandshakeError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        HandshakeError::Closed
    } else {
        HandshakeError::Io(e)
    }
}

async fn write_msg<W: AsyncWrite + Unpin>(writer: &mut W, msg: &[u8]) -> Result<(), HandshakeError> {
    let len = u16::try_from(msg.len()).map_err(|_| HandshakeError::Malformed("message too long"))?;
    let mut buf = Vec::with_capacity(2 + msg.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(msg);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_msg<R: AsyncRead + Unpin>(reader: &mut R, expected_len: usize) -> Result<Vec<u8>, HandshakeError> {
    let len = reader.read_u16().await.map_err(map_eof)? as usize;
    if len != expected_len {
        return Err(HandshakeError::Malformed("unexpected handshake message length"));
    }
    let mut msg = vec![0u8; len];
    reader.read_exact(&mut msg).await.map_err(map_eof)?;
    Ok(msg)
}

fn role_byte(role: Role) -> u8 {
    match role {
        Role::Initiator => 0x01,
        Role::Responder => 0x02,
    }
}

fn auth_payload(keypair: &Keypair, transcript: &[u8; 32], role: Role) -> Vec<u8> {
    let mut signed = transcript.to_vec();
    signed.push(role_byte(role));
    let signature = sign_with_domain(keypair, HANDSHAKE_SIGNATURE_DOMAIN, &signed);

    let mut payload = Vec::with_capacity(AUTH_PAYLOAD_LEN);
    payload.extend_from_slice(keypair.identity().as_bytes());
    payload.extend_from_slice(&signature);
    payload
}

fn verify_auth_payload(payload: &[u8], transcript: &[u8; 32], role: Role) -> Result<Identity, HandshakeError> {
    if payload.len() != AUTH_PAYLOAD_LEN {
        return Err(HandshakeError::Malformed("identity payload has wrong length"));
    }
    let mut id = [0u8; 32];
    id.copy_from_slice(&payload[..32]);
    let identity = Identity::from_bytes(id);
    if !identity.is_valid() {
        return Err(HandshakeError::InvalidKey);
    }

    let mut signed = transcript.to_vec();
    signed.push(role_byte(role));
    verify_with_domain(&identity, HANDSHAKE_SIGNATURE_DOMAIN, &signed, &payload[32..])
        .map_err(|_| HandshakeError::BadSignature)?;
    Ok(identity)
}

fn check_expected(expected: Option<Identity>, actual: Identity) -> Result<(), HandshakeError> {
    match expected {
        Some(expected) if expected != actual => Err(HandshakeError::IdentityMismatch { expected, actual }),
        _ => Ok(()),
    }
}

struct KeySchedule {
    shared: [u8; 32],
    transcript: [u8; 32],
}

impl KeySchedule {
    fn new(
        secret: EphemeralSecret,
        remote_ephemeral: [u8; 32],
        e_init: &[u8; 32],
        e_resp: &[u8; 32],
    ) -> Result<Self, HandshakeError> {
        let shared = secret.diffie_hellman(&PublicKey::from(remote_ephemeral));
        if !shared.was_contributory() {
            return Err(HandshakeError::WeakKey);
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(e_init);
        hasher.update(e_resp);
        Ok(Self {
            shared: *shared.as_bytes(),
            transcript: *hasher.finalize().as_bytes(),
        })
    }

    fn handshake_key(&self, role: Role) -> CipherState {
        let context = match role {
            Role::Initiator => KDF_HANDSHAKE_INITIATOR,
            Role::Responder => KDF_HANDSHAKE_RESPONDER,
        };
        CipherState::new(&derive_key(context, &[&self.shared, &self.transcript]))
    }

    /// Returns `(initiator → responder, responder → initiator)`.
    fn transport_keys(&self, initiator: &Identity, responder: &Identity) -> (CipherState, CipherState) {
        let parts: [&[u8]; 4] = [&self.shared, &self.transcript, initiator.as_bytes(), responder.as_bytes()];
        (
            CipherState::new(&derive_key(KDF_TRANSPORT_I2R, &parts)),
            CipherState::new(&derive_key(KDF_TRANSPORT_R2I, &parts)),
        )
    }
}

async fn initiate(keypair: &Keypair, io: &mut BoxedIo, expected: Option<Identity>) -> Result<Session, HandshakeError> {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let e_init = PublicKey::from(&secret).to_bytes();

    let mut hello = Vec::with_capacity(33);
    hello.push(HANDSHAKE_VERSION);
    hello.extend_from_slice(&e_init);
    write_msg(io, &hello).await?;

    let reply = read_msg(io, 1 + 32 + SEALED_AUTH_LEN).await?;
    if reply[0] != HANDSHAKE_VERSION {
        return Err(HandshakeError::UnsupportedVersion(reply[0]));
    }
    let mut e_resp = [0u8; 32];
    e_resp.copy_from_slice(&reply[1..33]);

    let keys = KeySchedule::new(secret, e_resp, &e_init, &e_resp)?;
    let payload = keys
        .handshake_key(Role::Responder)
        .open(&reply[33..])
        .map_err(|_| HandshakeError::Decrypt)?;
    let remote = verify_auth_payload(&payload, &keys.transcript, Role::Responder)?;
    check_expected(expected, remote)?;

    let sealed = keys
        .handshake_key(Role::Initiator)
        .seal(&auth_payload(keypair, &keys.transcript, Role::Initiator))
        .map_err(|_| HandshakeError::Decrypt)?;
    write_msg(io, &sealed).await?;

    let (send, recv) = keys.transport_keys(&keypair.identity(), &remote);
    trace!(peer = %remote.short(), "initiator handshake complete");
    Ok(Session { remote, send, recv })
}

async fn respond(keypair: &Keypair, io: &mut BoxedIo, expected: Option<Identity>) -> Result<Session, HandshakeError> {
    let hello = read_msg(io, 33).await?;
    if hello[0] != HANDSHAKE_VERSION {
        return Err(HandshakeError::UnsupportedVersion(hello[0]));
    }
    let mut e_init = [0u8; 32];
    e_init.copy_from_slice(&hello[1..33]);

    let secret = EphemeralSecret::random_from_rng(OsRng);
    let e_resp = PublicKey::from(&secret).to_bytes();
    let keys = KeySchedule::new(secret, e_init, &e_init, &e_resp)?;

    let sealed = keys
        .handshake_key(Role::Responder)
        .seal(&auth_payload(keypair, &keys.transcript, Role::Responder))
        .map_err(|_| HandshakeError::Decrypt)?;
    let mut reply = Vec::with_capacity(1 + 32 + sealed.len());
    reply.push(HANDSHAKE_VERSION);
    reply.extend_from_slice(&e_resp);
    reply.extend_from_slice(&sealed);
    write_msg(io, &reply).await?;

    let finish = read_msg(io, SEALED_AUTH_LEN).await?;
    let payload = keys
        .handshake_key(Role::Initiator)
        .open(&finish)
        .map_err(|_| HandshakeError::Decrypt)?;
    let remote = verify_auth_payload(&payload, &keys.transcript, Role::Initiator)?;
    check_expected(expected, remote)?;

    let (i2r, r2i) = keys.transport_keys(&remote, &keypair.identity());
    trace!(peer = %remote.short(), "responder handshake complete");
    Ok(Session {
        remote,
        send: r2i,
        recv: i2r,
    })
}

pub struct SecureReader<R> {
    inner: R,
    cipher: CipherState,
}

impl<R> SecureReader<R> {
    pub(crate) fn new(inner: R, cipher: CipherState) -> Self {
        Self { inner, cipher }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameRead for SecureReader<R> {
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let len = match self.inner.read_u16().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len < AEAD_TAG_LEN {
            return Err(ProtocolError::Decrypt);
        }
        let mut sealed = vec![0u8; len];
        self.inner.read_exact(&mut sealed).await?;
        self.cipher.open(&sealed).map(Some)
    }
}

pub struct SecureWriter<W> {
    inner: W,
    cipher: CipherState,
}

impl<W> SecureWriter<W> {
    pub(crate) fn new(inner: W, cipher: CipherState) -> Self {
        Self { inner, cipher }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWrite for SecureWriter<W> {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        if frame.len() > MAX_FRAME_PLAINTEXT {
            return Err(ProtocolError::FrameTooLarge {
                len: frame.len(),
                max: MAX_FRAME_PLAINTEXT,
            });
        }
        let sealed = self.cipher.seal(frame)?;
        let mut buf = Vec::with_capacity(2 + sealed.len());
        buf.extend_from_slice(&(sealed.len() as u16).to_be_bytes());
        buf.extend_from_slice(&sealed);
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    fn max_frame_len(&self) -> usize {
        MAX_FRAME_PLAINTEXT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn raw_pair() -> (RawConnection, RawConnection) {
        let (a, b) = duplex(64 * 1024);
        let addr = PeerAddr::direct("127.0.0.1:1".parse().unwrap());
        (
            RawConnection::new(a, addr.clone(), "memory"),
            RawConnection::new(b, addr, "memory"),
        )
    }

    async fn handshake(
        initiator: &Keypair,
        responder: &Keypair,
        expected: Option<Identity>,
    ) -> (
        Result<SecuredConnection, HandshakeError>,
        Result<SecuredConnection, HandshakeError>,
    ) {
        let (a, b) = raw_pair();
        let init = Negotiator::new(initiator.clone());
        let resp = Negotiator::new(responder.clone());
        tokio::join!(
            init.secure(a, Role::Initiator, expected),
            resp.secure(b, Role::Responder, None)
        )
    }

    #[tokio::test]
    async fn handshake_binds_identities() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let (a, b) = handshake(&alice, &bob, Some(bob.identity())).await;
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(a.remote, bob.identity());
        assert_eq!(a.local, alice.identity());
        assert_eq!(b.remote, alice.identity());
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let (a, b) = handshake(&alice, &bob, None).await;
        let mut a = a.unwrap();
        let mut b = b.unwrap();

        a.writer.write_frame(b"hello bob").await.unwrap();
        a.writer.write_frame(b"second").await.unwrap();
        b.writer.write_frame(b"hello alice").await.unwrap();

        assert_eq!(b.reader.read_frame().await.unwrap().unwrap(), b"hello bob");
        assert_eq!(b.reader.read_frame().await.unwrap().unwrap(), b"second");
        assert_eq!(a.reader.read_frame().await.unwrap().unwrap(), b"hello alice");
    }

    #[tokio::test]
    async fn clean_close_reads_none() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let (a, b) = handshake(&alice, &bob, None).await;
        let mut a = a.unwrap();
        let mut b = b.unwrap();

        a.writer.shutdown().await.unwrap();
        assert!(b.reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_expected_identity_is_mismatch() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let mallory = Keypair::generate();
        let (a, _b) = handshake(&alice, &bob, Some(mallory.identity())).await;
        match a {
            Err(HandshakeError::IdentityMismatch { expected, actual }) => {
                assert_eq!(expected, mallory.identity());
                assert_eq!(actual, bob.identity());
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected() {
        let (mut a, b) = raw_pair();
        let bob = Negotiator::new(Keypair::generate());
        let mut hello = vec![9u8];
        hello.extend_from_slice(&[1u8; 32]);
        write_msg(&mut a.io, &hello).await.unwrap();

        let err = bob.secure(b, Role::Responder, None).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnsupportedVersion(9)));
    }

    #[tokio::test]
    async fn low_order_ephemeral_is_weak_key() {
        let (mut a, b) = raw_pair();
        let bob = Negotiator::new(Keypair::generate());
        let mut hello = vec![HANDSHAKE_VERSION];
        hello.extend_from_slice(&[0u8; 32]);
        write_msg(&mut a.io, &hello).await.unwrap();

        let err = bob.secure(b, Role::Responder, None).await.unwrap_err();
        assert!(matches!(err, HandshakeError::WeakKey));
    }

    #[tokio::test]
    async fn peer_hanging_up_is_closed() {
        let (a, b) = raw_pair();
        drop(a);
        let bob = Negotiator::new(Keypair::generate());
        let err = bob.secure(b, Role::Responder, None).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Closed));
    }

    fn sealed(cipher: &mut CipherState, plaintext: &[u8]) -> Vec<u8> {
        let ct = cipher.seal(plaintext).unwrap();
        let mut out = (ct.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(&ct);
        out
    }

    #[tokio::test]
    async fn tampered_frame_fails_authentication() {
        let key = [5u8; 32];
        let mut sender = CipherState::new(&key);
        let mut wire = sealed(&mut sender, b"payload");
        let last = wire.len() - 1;
        wire[last] ^= 0x80;

        let mut reader = SecureReader::new(wire.as_slice(), CipherState::new(&key));
        assert!(matches!(reader.read_frame().await, Err(ProtocolError::Decrypt)));
    }

    #[tokio::test]
    async fn replayed_frame_fails_authentication() {
        let key = [6u8; 32];
        let mut sender = CipherState::new(&key);
        let frame = sealed(&mut sender, b"payload");
        let mut wire = frame.clone();
        wire.extend_from_slice(&frame);

        let mut reader = SecureReader::new(wire.as_slice(), CipherState::new(&key));
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"payload");
        assert!(matches!(reader.read_frame().await, Err(ProtocolError::Decrypt)));
    }

    #[tokio::test]
    async fn oversized_plaintext_is_rejected() {
        let mut writer = SecureWriter::new(Vec::new(), CipherState::new(&[1u8; 32]));
        let big = vec![0u8; MAX_FRAME_PLAINTEXT + 1];
        assert!(matches!(
            writer.write_frame(&big).await,
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
