//! Signing, verification and symmetric session crypto.
//!
//! Every signature in the overlay is domain separated: the signer prefixes the
//! payload with a context string so a signature produced for one message type
//! can never be replayed as another.
//!
//! Session traffic is protected with ChaCha20-Poly1305. Each direction owns a
//! [`CipherState`] whose nonce is an implicit 64-bit counter, so the receiver
//! rejects any frame that was modified, reordered, dropped or replayed.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, VerifyingKey};

use crate::error::ProtocolError;
use crate::identity::{Identity, Keypair};

/// Authentication tag appended to every sealed frame.
pub const AEAD_TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    Missing,
    InvalidLength,
    VerificationFailed,
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

pub const GOSSIP_SIGNATURE_DOMAIN: &[u8] = b"topology-net/gossip/v1:";
pub const PEER_RECORD_SIGNATURE_DOMAIN: &[u8] = b"topology-net/peer-record/v1:";
pub const HANDSHAKE_SIGNATURE_DOMAIN: &[u8] = b"topology-net/handshake/v1:";
pub const RELAY_RESERVE_SIGNATURE_DOMAIN: &[u8] = b"topology-net/relay-reserve/v1:";

/// Key derivation contexts for [`blake3::derive_key`].
pub(crate) const KDF_HANDSHAKE_INITIATOR: &str = "topology-net 2026 handshake initiator key";
pub(crate) const KDF_HANDSHAKE_RESPONDER: &str = "topology-net 2026 handshake responder key";
pub(crate) const KDF_TRANSPORT_I2R: &str = "topology-net 2026 transport initiator-to-responder key";
pub(crate) const KDF_TRANSPORT_R2I: &str = "topology-net 2026 transport responder-to-initiator key";

pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify `signature` over `domain || data` against `identity`, using strict
/// Ed25519 verification (rejects malleable and small-order encodings).
pub fn verify_with_domain(
    identity: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;

    let verifying_key = VerifyingKey::try_from(identity.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Derive a 32-byte key bound to `context` from the concatenation of `parts`.
pub(crate) fn derive_key(context: &str, parts: &[&[u8]]) -> [u8; 32] {
    let material: Vec<u8> = parts.iter().flat_map(|p| p.iter().copied()).collect();
    blake3::derive_key(context, &material)
}

/// One direction of an encrypted session.
pub struct CipherState {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl CipherState {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12], ProtocolError> {
        if self.counter == u64::MAX {
            return Err(ProtocolError::NonceExhausted);
        }
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        Ok(nonce)
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ProtocolError::Decrypt)
    }

    /// Decrypt the next frame. Any failure leaves the state unusable from the
    /// peer's point of view, so callers must drop the connection.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| ProtocolError::Decrypt)
    }

    #[cfg(test)]
    pub(crate) fn set_counter(&mut self, counter: u64) {
        self.counter = counter;
    }
}
