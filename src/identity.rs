//! # Identity and Signed Peer Records
//!
//! Every node is named by its Ed25519 public key. There is no separate
//! identifier layer: the 32-byte verifying key *is* the peer identity, so any
//! party holding an [`Identity`] can check signatures made by that peer.
//!
//! [`PeerRecord`] binds an identity to the addresses it can be reached at.
//! Records are signed by the identity they describe and carry a millisecond
//! timestamp, which lets receivers reject replays of stale address sets.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::crypto::{PEER_RECORD_SIGNATURE_DOMAIN, SignatureError, sign_with_domain, verify_with_domain};

/// Maximum addresses a single record may advertise.
pub const MAX_RECORD_ADDRS: usize = 16;

/// Maximum length in bytes of one advertised address.
pub const MAX_RECORD_ADDR_LEN: usize = 256;

/// Records stamped further than this into the future are treated as clock skew.
const FUTURE_TOLERANCE_MS: u64 = 5_000;

/// Milliseconds since the Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Reject timestamps older than `window` or more than
/// [`FUTURE_TOLERANCE_MS`] ahead of `now`.
pub(crate) fn check_timestamp(timestamp_ms: u64, window: Duration, now: u64) -> Result<(), FreshnessError> {
    if timestamp_ms > now.saturating_add(FUTURE_TOLERANCE_MS) {
        return Err(FreshnessError::ClockSkewFuture {
            record_ts: timestamp_ms,
            local_ts: now,
            drift_ms: timestamp_ms - now,
        });
    }
    let age_ms = now.saturating_sub(timestamp_ms);
    if age_ms > window.as_millis() as u64 {
        return Err(FreshnessError::Stale {
            record_ts: timestamp_ms,
            local_ts: now,
            age_ms,
        });
    }
    Ok(())
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }

    /// Create a signed record advertising `addrs` for this keypair's identity.
    pub fn create_record(&self, addrs: Vec<String>) -> PeerRecord {
        self.create_record_at(addrs, now_ms())
    }

    pub(crate) fn create_record_at(&self, addrs: Vec<String>, timestamp_ms: u64) -> PeerRecord {
        let peer_id = self.identity();
        let payload = PeerRecord::signed_payload(&peer_id, &addrs, timestamp_ms);
        let signature = sign_with_domain(self, PEER_RECORD_SIGNATURE_DOMAIN, &payload);
        PeerRecord {
            peer_id,
            addrs,
            timestamp_ms,
            signature,
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity().to_hex())
            .finish_non_exhaustive()
    }
}

/// A peer identity: the peer's Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Abbreviated hex form used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// True when the bytes decode to an Ed25519 point usable for verification.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Identity {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A signed statement "peer `peer_id` is reachable at `addrs`", as circulated
/// by peer discovery and PRUNE peer exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: Identity,
    pub addrs: Vec<String>,
    pub timestamp_ms: u64,
    pub signature: Vec<u8>,
}

/// Reasons a [`PeerRecord`] may fail freshness verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessError {
    SignatureInvalid,
    ClockSkewFuture { record_ts: u64, local_ts: u64, drift_ms: u64 },
    Stale { record_ts: u64, local_ts: u64, age_ms: u64 },
}

impl fmt::Display for FreshnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreshnessError::SignatureInvalid => write!(f, "record signature is invalid"),
            FreshnessError::ClockSkewFuture { drift_ms, .. } => {
                write!(f, "record timestamp is {drift_ms}ms in the future")
            }
            FreshnessError::Stale { age_ms, .. } => write!(f, "record is stale ({age_ms}ms old)"),
        }
    }
}

impl std::error::Error for FreshnessError {}

impl PeerRecord {
    /// Canonical signed bytes:
    /// `peer_id(32) || addr_count(4) || [addr_len(4) || addr]* || timestamp(8)`.
    fn signed_payload(peer_id: &Identity, addrs: &[String], timestamp_ms: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(32 + 4 + addrs.iter().map(|a| a.len() + 4).sum::<usize>() + 8);
        data.extend_from_slice(peer_id.as_bytes());
        data.extend_from_slice(&(addrs.len() as u32).to_le_bytes());
        for addr in addrs {
            data.extend_from_slice(&(addr.len() as u32).to_le_bytes());
            data.extend_from_slice(addr.as_bytes());
        }
        data.extend_from_slice(&timestamp_ms.to_le_bytes());
        data
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        if self.signature.is_empty() || self.timestamp_ms == 0 {
            return Err(SignatureError::Missing);
        }
        let payload = Self::signed_payload(&self.peer_id, &self.addrs, self.timestamp_ms);
        verify_with_domain(&self.peer_id, PEER_RECORD_SIGNATURE_DOMAIN, &payload, &self.signature)
    }

    /// Verify the signature and reject records older than `window` or
    /// stamped too far in the future.
    pub fn verify_fresh(&self, window: Duration) -> Result<(), FreshnessError> {
        self.verify_fresh_at(window, now_ms())
    }

    pub(crate) fn verify_fresh_at(&self, window: Duration, now: u64) -> Result<(), FreshnessError> {
        if self.verify().is_err() {
            return Err(FreshnessError::SignatureInvalid);
        }
        check_timestamp(self.timestamp_ms, window, now)
    }

    /// Bounds and format checks for records decoded from the network.
    /// Does not check the signature.
    pub fn validate_structure(&self) -> bool {
        if self.addrs.len() > MAX_RECORD_ADDRS {
            return false;
        }
        if self
            .addrs
            .iter()
            .any(|a| a.is_empty() || a.len() > MAX_RECORD_ADDR_LEN)
        {
            return false;
        }
        self.signature.len() == 64 && self.peer_id.is_valid()
    }
}
