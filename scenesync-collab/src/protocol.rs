//! Binary wire protocol for scene synchronization.
//!
//! Every message travels as one bincode-encoded frame:
//! ```text
//! ┌──────────┬─────────┬─────────┬──────────────────────────────┐
//! │ version  │ tag     │ flags   │ body                         │
//! │ u16      │ u8      │ u8      │ bincode(payload), maybe LZ4  │
//! └──────────┴─────────┴─────────┴──────────────────────────────┘
//! flags bit 0 = body compressed; other bits are ignored
//! ```
//!
//! Forward compatibility:
//! - an unknown tag decodes to [`Message::Unknown`], which receivers ignore
//! - bodies are decoded leniently, trailing bytes appended by a newer
//!   peer are skipped
//! - operations travel as [`WireOperation`], a fixed header plus
//!   `(kind_tag, kind_body)`, so an unknown kind becomes [`OpKind::Opaque`]
//!
//! Performance target: small operation encode < 1μs, no compression below
//! the threshold.
//! Reference: Patterson & Hennessy, Section 5.7 — Data Compression

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use scenesync_core::{ComponentKind, EntityId, OpId, OpKind, Operation, Sequenced, SessionId, Snapshot, Value};

use crate::compression::{compression_ratio, BlockCompressor, Lz4Compressor};

/// Version this build speaks.
pub const PROTOCOL_VERSION: u16 = 1;
/// Oldest version this build still accepts.
pub const MIN_PROTOCOL_VERSION: u16 = 1;
/// Bodies at least this large are compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Frame flag: body is block-compressed.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

const KIND_CREATE: u8 = 1;
const KIND_DELETE: u8 = 2;
const KIND_REPARENT: u8 = 3;
const KIND_REORDER: u8 = 4;
const KIND_SET_COMPONENT: u8 = 5;
const KIND_SET_PROPERTY: u8 = 6;

/// Message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageTag {
    Handshake = 1,
    Snapshot = 2,
    Operation = 3,
    Ack = 4,
    Heartbeat = 5,
    HeartbeatAck = 6,
    ResyncRequest = 7,
    LockRequest = 8,
    LockRelease = 9,
    LockChanged = 10,
    PeerJoined = 11,
    PeerLeft = 12,
    Goodbye = 13,
}

impl MessageTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::Handshake,
            2 => Self::Snapshot,
            3 => Self::Operation,
            4 => Self::Ack,
            5 => Self::Heartbeat,
            6 => Self::HeartbeatAck,
            7 => Self::ResyncRequest,
            8 => Self::LockRequest,
            9 => Self::LockRelease,
            10 => Self::LockChanged,
            11 => Self::PeerJoined,
            12 => Self::PeerLeft,
            13 => Self::Goodbye,
            _ => return None,
        })
    }
}

/// Participant identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    /// RGBA color for lock badges and selection outlines
    pub color: [f32; 4],
}

impl SessionInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(SessionId::new(), name)
    }

    /// Create with an explicit id (for testing)
    pub fn with_id(id: SessionId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            color: session_color(id.0),
        }
    }
}

/// Stable, well-spread color from a session id.
fn session_color(id: Uuid) -> [f32; 4] {
    let hue = ((id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    [r, g, b, 1.0]
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// First message in each direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Handshake {
    pub version: u16,
    pub min_version: u16,
    pub session: SessionInfo,
    pub scene_id: Uuid,
    /// Client: last sequence it holds, `None` for a fresh join.
    /// Server: its current sequence.
    pub last_seq: Option<u64>,
}

impl Handshake {
    pub fn new(session: SessionInfo, scene_id: Uuid, last_seq: Option<u64>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            min_version: MIN_PROTOCOL_VERSION,
            session,
            scene_id,
            last_seq,
        }
    }

    /// Each side speaks a version the other still accepts.
    pub fn is_compatible(&self, other: &Handshake) -> bool {
        other.version >= self.min_version && self.version >= other.min_version
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(Handshake),
    Snapshot(Snapshot),
    /// Server to client: a sequenced operation.
    /// Client to server: a local operation with `seq == 0`.
    Operation(Sequenced),
    /// The server sequenced the receiver's operation `clock` at `seq`
    Ack { clock: u64, seq: u64 },
    Heartbeat { nonce: u64 },
    /// Echoes the nonce with the authoritative sequence and checksum
    HeartbeatAck { nonce: u64, seq: u64, checksum: u64 },
    ResyncRequest { last_seq: u64 },
    LockRequest { entity: EntityId },
    LockRelease { entity: EntityId },
    LockChanged { entity: EntityId, owner: Option<SessionId> },
    PeerJoined(SessionInfo),
    PeerLeft(SessionId),
    Goodbye { reason: String },
    /// A message from a newer peer. Ignored by receivers.
    Unknown { tag: u8, body: Vec<u8> },
}

impl Message {
    /// Wrap a local operation for submission to the relay.
    pub fn submit(op: Operation) -> Self {
        Message::Operation(Sequenced::new(0, op))
    }

    pub fn tag(&self) -> u8 {
        let tag = match self {
            Message::Handshake(_) => MessageTag::Handshake,
            Message::Snapshot(_) => MessageTag::Snapshot,
            Message::Operation(_) => MessageTag::Operation,
            Message::Ack { .. } => MessageTag::Ack,
            Message::Heartbeat { .. } => MessageTag::Heartbeat,
            Message::HeartbeatAck { .. } => MessageTag::HeartbeatAck,
            Message::ResyncRequest { .. } => MessageTag::ResyncRequest,
            Message::LockRequest { .. } => MessageTag::LockRequest,
            Message::LockRelease { .. } => MessageTag::LockRelease,
            Message::LockChanged { .. } => MessageTag::LockChanged,
            Message::PeerJoined(_) => MessageTag::PeerJoined,
            Message::PeerLeft(_) => MessageTag::PeerLeft,
            Message::Goodbye { .. } => MessageTag::Goodbye,
            Message::Unknown { tag, .. } => return *tag,
        };
        tag as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::Snapshot(_) => "snapshot",
            Message::Operation(_) => "operation",
            Message::Ack { .. } => "ack",
            Message::Heartbeat { .. } => "heartbeat",
            Message::HeartbeatAck { .. } => "heartbeat-ack",
            Message::ResyncRequest { .. } => "resync-request",
            Message::LockRequest { .. } => "lock-request",
            Message::LockRelease { .. } => "lock-release",
            Message::LockChanged { .. } => "lock-changed",
            Message::PeerJoined(_) => "peer-joined",
            Message::PeerLeft(_) => "peer-left",
            Message::Goodbye { .. } => "goodbye",
            Message::Unknown { .. } => "unknown",
        }
    }
}

/// Outer envelope of every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub version: u16,
    pub tag: u8,
    pub flags: u8,
    pub body: Vec<u8>,
}

/// An operation as it travels: fixed header, kind as tag plus body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireOperation {
    pub id: OpId,
    pub target: EntityId,
    pub base_revision: u64,
    pub kind_tag: u8,
    pub kind_body: Vec<u8>,
}

impl WireOperation {
    pub fn encode(op: &Operation) -> Result<Self, EncodeError> {
        let (kind_tag, kind_body) = match &op.kind {
            OpKind::Create {
                parent,
                index,
                properties,
                components,
            } => (KIND_CREATE, to_vec(&(parent, index, properties, components))?),
            OpKind::Delete => (KIND_DELETE, Vec::new()),
            OpKind::Reparent { parent, index } => (KIND_REPARENT, to_vec(&(parent, index))?),
            OpKind::Reorder { index } => (KIND_REORDER, to_vec(index)?),
            OpKind::SetComponent { kind, data } => (KIND_SET_COMPONENT, to_vec(&(kind, data))?),
            OpKind::SetProperty { key, value } => (KIND_SET_PROPERTY, to_vec(&(key, value))?),
            OpKind::Opaque { tag, body } => (*tag, body.clone()),
        };
        Ok(Self {
            id: op.id,
            target: op.target,
            base_revision: op.base_revision,
            kind_tag,
            kind_body,
        })
    }

    pub fn into_operation(self) -> Result<Operation, DecodeError> {
        let body = self.kind_body.as_slice();
        let kind = match self.kind_tag {
            KIND_CREATE => {
                let (parent, index, properties, components): (
                    Option<EntityId>,
                    Option<u32>,
                    BTreeMap<String, Value>,
                    BTreeMap<ComponentKind, Vec<u8>>,
                ) = from_slice(body)?;
                OpKind::Create {
                    parent,
                    index,
                    properties,
                    components,
                }
            }
            KIND_DELETE => OpKind::Delete,
            KIND_REPARENT => {
                let (parent, index) = from_slice(body)?;
                OpKind::Reparent { parent, index }
            }
            KIND_REORDER => OpKind::Reorder {
                index: from_slice(body)?,
            },
            KIND_SET_COMPONENT => {
                let (kind, data) = from_slice(body)?;
                OpKind::SetComponent { kind, data }
            }
            KIND_SET_PROPERTY => {
                let (key, value) = from_slice(body)?;
                OpKind::SetProperty { key, value }
            }
            tag => OpKind::Opaque {
                tag,
                body: self.kind_body,
            },
        };
        Ok(Operation::new(self.id, self.target, self.base_revision, kind))
    }
}

/// Malformed input. The message is dropped, the connection survives,
/// except during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message truncated")]
    Truncated,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("decompression failed: {0}")]
    Decompression(String),
}

impl From<bincode::error::DecodeError> for DecodeError {
    fn from(e: bincode::error::DecodeError) -> Self {
        match e {
            bincode::error::DecodeError::UnexpectedEnd { .. } => DecodeError::Truncated,
            other => DecodeError::Malformed(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("serialization failed: {0}")]
    Serialization(String),
}

fn to_vec<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| EncodeError::Serialization(e.to_string()))
}

/// Decode a value, ignoring trailing bytes.
fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

/// Encodes and decodes [`Message`]s, compressing large bodies.
#[derive(Debug, Clone)]
pub struct WireCodec {
    compressor: Arc<dyn BlockCompressor>,
    threshold: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD)
    }
}

impl WireCodec {
    /// LZ4 codec compressing bodies of at least `threshold` bytes.
    pub fn new(threshold: usize) -> Self {
        Self::with_compressor(Arc::new(Lz4Compressor), threshold)
    }

    pub fn with_compressor(compressor: Arc<dyn BlockCompressor>, threshold: usize) -> Self {
        Self { compressor, threshold }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Serialize to binary wire format.
    pub fn encode(&self, msg: &Message) -> Result<Vec<u8>, EncodeError> {
        let body = encode_body(msg)?;
        let (flags, body) = if body.len() >= self.threshold {
            let packed = self.compressor.compress(&body);
            log::trace!(
                "{} body {} -> {} bytes ({:.1}x, {})",
                msg.name(),
                body.len(),
                packed.len(),
                compression_ratio(body.len(), packed.len()),
                self.compressor.name()
            );
            (FLAG_COMPRESSED, packed)
        } else {
            (0, body)
        };
        to_vec(&Frame {
            version: PROTOCOL_VERSION,
            tag: msg.tag(),
            flags,
            body,
        })
    }

    /// Deserialize from binary wire format.
    pub fn decode(&self, bytes: &[u8]) -> Result<Message, DecodeError> {
        let frame: Frame = from_slice(bytes)?;
        let body = if frame.flags & FLAG_COMPRESSED != 0 {
            self.compressor
                .decompress(&frame.body)
                .map_err(DecodeError::Decompression)?
        } else {
            frame.body
        };
        decode_body(frame.tag, body)
    }
}

fn encode_body(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    match msg {
        Message::Handshake(h) => to_vec(h),
        Message::Snapshot(s) => to_vec(s),
        Message::Operation(s) => to_vec(&(s.seq, WireOperation::encode(&s.op)?)),
        Message::Ack { clock, seq } => to_vec(&(clock, seq)),
        Message::Heartbeat { nonce } => to_vec(nonce),
        Message::HeartbeatAck { nonce, seq, checksum } => to_vec(&(nonce, seq, checksum)),
        Message::ResyncRequest { last_seq } => to_vec(last_seq),
        Message::LockRequest { entity } | Message::LockRelease { entity } => to_vec(entity),
        Message::LockChanged { entity, owner } => to_vec(&(entity, owner)),
        Message::PeerJoined(info) => to_vec(info),
        Message::PeerLeft(id) => to_vec(id),
        Message::Goodbye { reason } => to_vec(reason),
        Message::Unknown { body, .. } => Ok(body.clone()),
    }
}

fn decode_body(tag: u8, body: Vec<u8>) -> Result<Message, DecodeError> {
    let Some(known) = MessageTag::from_u8(tag) else {
        return Ok(Message::Unknown { tag, body });
    };
    let b = body.as_slice();
    Ok(match known {
        MessageTag::Handshake => Message::Handshake(from_slice(b)?),
        MessageTag::Snapshot => Message::Snapshot(from_slice(b)?),
        MessageTag::Operation => {
            let (seq, wire): (u64, WireOperation) = from_slice(b)?;
            Message::Operation(Sequenced::new(seq, wire.into_operation()?))
        }
        MessageTag::Ack => {
            let (clock, seq) = from_slice(b)?;
            Message::Ack { clock, seq }
        }
        MessageTag::Heartbeat => Message::Heartbeat { nonce: from_slice(b)? },
        MessageTag::HeartbeatAck => {
            let (nonce, seq, checksum) = from_slice(b)?;
            Message::HeartbeatAck { nonce, seq, checksum }
        }
        MessageTag::ResyncRequest => Message::ResyncRequest {
            last_seq: from_slice(b)?,
        },
        MessageTag::LockRequest => Message::LockRequest { entity: from_slice(b)? },
        MessageTag::LockRelease => Message::LockRelease { entity: from_slice(b)? },
        MessageTag::LockChanged => {
            let (entity, owner) = from_slice(b)?;
            Message::LockChanged { entity, owner }
        }
        MessageTag::PeerJoined => Message::PeerJoined(from_slice(b)?),
        MessageTag::PeerLeft => Message::PeerLeft(from_slice(b)?),
        MessageTag::Goodbye => Message::Goodbye { reason: from_slice(b)? },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenesync_core::{SceneState, DefaultPolicy};

    const A: SessionId = SessionId::from_u128(0xA);

    fn op(clock: u64, target: u128, base: u64, kind: OpKind) -> Operation {
        Operation::new(OpId { session: A, clock }, EntityId::from_u128(target), base, kind)
    }

    fn roundtrip(codec: &WireCodec, msg: &Message) -> Message {
        let bytes = codec.encode(msg).unwrap();
        codec.decode(&bytes).unwrap()
    }

    #[test]
    fn test_operation_kinds_roundtrip() {
        let codec = WireCodec::default();
        let mut props = BTreeMap::new();
        props.insert("name".to_string(), Value::from("Rock"));
        props.insert("scale".to_string(), Value::Vec3([1.0, 2.0, 1.0]));
        let kinds = vec![
            OpKind::Create {
                parent: Some(EntityId::from_u128(1)),
                index: Some(3),
                properties: props,
                components: [(ComponentKind::Mesh, vec![7; 32])].into_iter().collect(),
            },
            OpKind::Delete,
            OpKind::Reparent { parent: None, index: Some(0) },
            OpKind::Reorder { index: 2 },
            OpKind::SetComponent {
                kind: ComponentKind::Opaque(900),
                data: None,
            },
            OpKind::SetProperty {
                key: "tags".into(),
                value: Some(Value::List(vec![Value::Null, Value::Reference(EntityId::from_u128(9))])),
            },
        ];
        for (i, kind) in kinds.into_iter().enumerate() {
            let msg = Message::Operation(Sequenced::new(40 + i as u64, op(i as u64 + 1, 5, 2, kind)));
            assert_eq!(roundtrip(&codec, &msg), msg);
        }
    }

    #[test]
    fn test_unknown_operation_kind_is_opaque() {
        let wire = WireOperation {
            id: OpId { session: A, clock: 3 },
            target: EntityId::from_u128(5),
            base_revision: 1,
            kind_tag: 42,
            kind_body: vec![1, 2, 3],
        };
        let body = to_vec(&(9u64, &wire)).unwrap();
        let bytes = to_vec(&Frame {
            version: PROTOCOL_VERSION + 1,
            tag: MessageTag::Operation as u8,
            flags: 0,
            body,
        })
        .unwrap();

        let codec = WireCodec::default();
        let Message::Operation(s) = codec.decode(&bytes).unwrap() else {
            panic!("expected an operation");
        };
        assert_eq!(s.seq, 9);
        assert_eq!(s.op.kind, OpKind::Opaque { tag: 42, body: vec![1, 2, 3] });

        // Relayed unchanged by an older build
        let again = codec.decode(&codec.encode(&Message::Operation(s)).unwrap()).unwrap();
        let Message::Operation(s) = again else { panic!() };
        assert_eq!(WireOperation::encode(&s.op).unwrap(), wire);
    }

    #[test]
    fn test_snapshot_is_compressed_and_roundtrips() {
        let mut state = SceneState::default();
        let root = EntityId::from_u128(1);
        state.sequence(op(1, 1, 0, OpKind::create_root()), &DefaultPolicy);
        for i in 2..200u128 {
            state.sequence(op(i as u64, i, 0, OpKind::create_under(root)), &DefaultPolicy);
        }
        let msg = Message::Snapshot(state.snapshot());

        let codec = WireCodec::default();
        let bytes = codec.encode(&msg).unwrap();
        let frame: Frame = from_slice(&bytes).unwrap();
        assert_eq!(frame.flags & FLAG_COMPRESSED, FLAG_COMPRESSED);
        assert_eq!(codec.decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_small_messages_skip_compression() {
        let codec = WireCodec::default();
        let msg = Message::submit(op(1, 5, 3, OpKind::set_property("visible", false)));
        let bytes = codec.encode(&msg).unwrap();
        let frame: Frame = from_slice(&bytes).unwrap();
        assert_eq!(frame.flags, 0);
        assert!(bytes.len() < 128, "operation frame is {} bytes", bytes.len());
    }

    #[test]
    fn test_unknown_tag_and_flags_tolerated() {
        let codec = WireCodec::default();
        let bytes = to_vec(&Frame {
            version: 7,
            tag: 200,
            flags: 0b1000_0000,
            body: vec![9, 9],
        })
        .unwrap();
        assert_eq!(
            codec.decode(&bytes).unwrap(),
            Message::Unknown { tag: 200, body: vec![9, 9] }
        );
    }

    #[test]
    fn test_trailing_body_bytes_ignored() {
        let mut body = to_vec(&(4u64, 12u64)).unwrap();
        body.extend_from_slice(&[0xAB; 6]);
        let bytes = to_vec(&Frame {
            version: PROTOCOL_VERSION,
            tag: MessageTag::Ack as u8,
            flags: 0,
            body,
        })
        .unwrap();
        assert_eq!(
            WireCodec::default().decode(&bytes).unwrap(),
            Message::Ack { clock: 4, seq: 12 }
        );
    }

    #[test]
    fn test_truncated_and_corrupt_input() {
        let codec = WireCodec::default();
        let bytes = codec
            .encode(&Message::Goodbye {
                reason: "protocol version 9 is too new".into(),
            })
            .unwrap();
        assert_eq!(codec.decode(&bytes[..bytes.len() / 2]), Err(DecodeError::Truncated));
        assert_eq!(codec.decode(&[]), Err(DecodeError::Truncated));

        let corrupt = to_vec(&Frame {
            version: PROTOCOL_VERSION,
            tag: MessageTag::Snapshot as u8,
            flags: FLAG_COMPRESSED,
            body: vec![16, 0, 0, 0, 0xF0],
        })
        .unwrap();
        assert!(matches!(codec.decode(&corrupt), Err(DecodeError::Decompression(_))));
    }

    #[test]
    fn test_handshake_compatibility() {
        let info = SessionInfo::with_id(A, "Alice");
        let ours = Handshake::new(info.clone(), Uuid::nil(), None);
        let mut newer = ours.clone();
        newer.version = PROTOCOL_VERSION + 1;
        assert!(ours.is_compatible(&newer));

        newer.min_version = PROTOCOL_VERSION + 1;
        assert!(!ours.is_compatible(&newer));
        assert!(!newer.is_compatible(&ours));
    }

    #[test]
    fn test_session_color_is_stable() {
        let a = SessionInfo::with_id(A, "Alice");
        let b = SessionInfo::with_id(A, "Alice again");
        assert_eq!(a.color, b.color);
        assert_eq!(a.color[3], 1.0);
        assert!(a.color[..3].iter().all(|c| (0.0..=1.0).contains(c)));
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }
}
