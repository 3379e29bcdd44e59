//! # Gossip Wire Format
//!
//! Every gossip frame on a stream is
//!
//! ```text
//! [varint length][1-byte frame type][payload]
//! ```
//!
//! where `length` counts the type byte plus the payload. Payloads are bincode
//! encoded with a hard size limit.
//!
//! | Type | Byte | Payload |
//! |------|------|---------|
//! | DATA | 0x01 | topic, msg id, source, seqno, data, signature |
//! | GRAFT | 0x02 | topic |
//! | PRUNE | 0x03 | topic, backoff, peer exchange records |
//! | IHAVE | 0x04 | topic, message ids |
//! | IWANT | 0x05 | message ids |
//! | SUBSCRIBE | 0x06 | topic |
//! | UNSUBSCRIBE | 0x07 | topic |

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::ProtocolError;
use crate::identity::{Identity, PeerRecord};

/// Largest application payload a single message may carry.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Largest encoded frame (type byte plus payload) accepted off the wire.
pub const MAX_FRAME_LEN: usize = MAX_PAYLOAD_SIZE + 8 * 1024;

/// Longest LEB128 encoding of a u64.
const MAX_VARINT_LEN: usize = 10;

/// Content address of a gossip message.
pub type MessageId = [u8; 32];

/// `blake3(topic || source || seqno || data)`.
pub fn compute_message_id(topic: &str, source: &Identity, seqno: u64, data: &[u8]) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(topic.len() as u32).to_le_bytes());
    hasher.update(topic.as_bytes());
    hasher.update(source.as_bytes());
    hasher.update(&seqno.to_le_bytes());
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_LEN as u64)
        .with_fixint_encoding()
}

pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode_options()
        .serialize(value)
        .map_err(|e| ProtocolError::Decode(e.to_string()))
}

pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    bincode_options()
        .deserialize(bytes)
        .map_err(|e| ProtocolError::Decode(e.to_string()))
}

pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decode a LEB128 varint from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the value and the
/// number of bytes consumed.
pub fn decode_varint(buf: &[u8]) -> Result<Option<(u64, usize)>, ProtocolError> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(ProtocolError::MalformedVarint);
        }
        let bits = u64::from(byte & 0x7f);
        if i == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(ProtocolError::MalformedVarint);
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(ProtocolError::MalformedVarint);
    }
    Ok(None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x01,
    Graft = 0x02,
    Prune = 0x03,
    IHave = 0x04,
    IWant = 0x05,
    Subscribe = 0x06,
    Unsubscribe = 0x07,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x01 => FrameType::Data,
            0x02 => FrameType::Graft,
            0x03 => FrameType::Prune,
            0x04 => FrameType::IHave,
            0x05 => FrameType::IWant,
            0x06 => FrameType::Subscribe,
            0x07 => FrameType::Unsubscribe,
            other => return Err(ProtocolError::UnknownFrameType(other)),
        })
    }
}

/// A published message as it travels between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrame {
    pub topic: String,
    pub msg_id: MessageId,
    pub source: Identity,
    pub seqno: u64,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct TopicPayload {
    topic: String,
}

#[derive(Serialize, Deserialize)]
struct PrunePayload {
    topic: String,
    backoff_secs: u64,
    peers: Vec<PeerRecord>,
}

#[derive(Serialize, Deserialize)]
struct IHavePayload {
    topic: String,
    msg_ids: Vec<MessageId>,
}

#[derive(Serialize, Deserialize)]
struct IWantPayload {
    msg_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipFrame {
    Data(DataFrame),
    Graft { topic: String },
    Prune { topic: String, backoff_secs: u64, peers: Vec<PeerRecord> },
    IHave { topic: String, msg_ids: Vec<MessageId> },
    IWant { msg_ids: Vec<MessageId> },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

impl GossipFrame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            GossipFrame::Data(_) => FrameType::Data,
            GossipFrame::Graft { .. } => FrameType::Graft,
            GossipFrame::Prune { .. } => FrameType::Prune,
            GossipFrame::IHave { .. } => FrameType::IHave,
            GossipFrame::IWant { .. } => FrameType::IWant,
            GossipFrame::Subscribe { .. } => FrameType::Subscribe,
            GossipFrame::Unsubscribe { .. } => FrameType::Unsubscribe,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            GossipFrame::Data(d) => Some(&d.topic),
            GossipFrame::Graft { topic }
            | GossipFrame::Prune { topic, .. }
            | GossipFrame::IHave { topic, .. }
            | GossipFrame::Subscribe { topic }
            | GossipFrame::Unsubscribe { topic } => Some(topic),
            GossipFrame::IWant { .. } => None,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            GossipFrame::Data(data) => serialize_bounded(data),
            GossipFrame::Graft { topic }
            | GossipFrame::Subscribe { topic }
            | GossipFrame::Unsubscribe { topic } => serialize_bounded(&TopicPayload {
                topic: topic.clone(),
            }),
            GossipFrame::Prune { topic, backoff_secs, peers } => serialize_bounded(&PrunePayload {
                topic: topic.clone(),
                backoff_secs: *backoff_secs,
                peers: peers.clone(),
            }),
            GossipFrame::IHave { topic, msg_ids } => serialize_bounded(&IHavePayload {
                topic: topic.clone(),
                msg_ids: msg_ids.clone(),
            }),
            GossipFrame::IWant { msg_ids } => serialize_bounded(&IWantPayload {
                msg_ids: msg_ids.clone(),
            }),
        }
    }

    fn decode_payload(frame_type: FrameType, payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match frame_type {
            FrameType::Data => GossipFrame::Data(deserialize_bounded(payload)?),
            FrameType::Graft => GossipFrame::Graft {
                topic: deserialize_bounded::<TopicPayload>(payload)?.topic,
            },
            FrameType::Subscribe => GossipFrame::Subscribe {
                topic: deserialize_bounded::<TopicPayload>(payload)?.topic,
            },
            FrameType::Unsubscribe => GossipFrame::Unsubscribe {
                topic: deserialize_bounded::<TopicPayload>(payload)?.topic,
            },
            FrameType::Prune => {
                let p: PrunePayload = deserialize_bounded(payload)?;
                GossipFrame::Prune {
                    topic: p.topic,
                    backoff_secs: p.backoff_secs,
                    peers: p.peers,
                }
            }
            FrameType::IHave => {
                let p: IHavePayload = deserialize_bounded(payload)?;
                GossipFrame::IHave {
                    topic: p.topic,
                    msg_ids: p.msg_ids,
                }
            }
            FrameType::IWant => GossipFrame::IWant {
                msg_ids: deserialize_bounded::<IWantPayload>(payload)?.msg_ids,
            },
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = self.encode_payload()?;
        let len = payload.len() + 1;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge { len, max: MAX_FRAME_LEN });
        }
        let mut out = Vec::with_capacity(len + MAX_VARINT_LEN);
        encode_varint(len as u64, &mut out);
        out.push(self.frame_type() as u8);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` does not yet hold a complete frame.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        let Some((len, prefix)) = decode_varint(buf)? else {
            return Ok(None);
        };
        let len = usize::try_from(len).map_err(|_| ProtocolError::MalformedVarint)?;
        if len == 0 {
            return Err(ProtocolError::Decode("empty frame".into()));
        }
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge { len, max: MAX_FRAME_LEN });
        }
        if buf.len() < prefix + len {
            return Ok(None);
        }
        let body = &buf[prefix..prefix + len];
        let frame_type = FrameType::try_from(body[0])?;
        let frame = Self::decode_payload(frame_type, &body[1..])?;
        Ok(Some((frame, prefix + len)))
    }
}

/// Reassembles frames from a byte stream delivered in arbitrary chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Result<Option<GossipFrame>, ProtocolError> {
        match GossipFrame::decode(&self.buf)? {
            Some((frame, used)) => {
                self.buf.drain(..used);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
