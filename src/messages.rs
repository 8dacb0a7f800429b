//! # Wire Protocol Messages
//!
//! Every DHT RPC travels as one [`Message`], framed on the stream as an
//! unsigned varint (LEB128) length followed by a bincode body:
//!
//! ```text
//! +-------------------+------------------------------+
//! | uvarint(len)      | bincode(Message), len bytes  |
//! +-------------------+------------------------------+
//! ```
//!
//! ## Message Fields
//!
//! | Field | Used by |
//! |-------|---------|
//! | `msg_type` | all |
//! | `key` | all but PING |
//! | `record` | PUT_VALUE request and reply, GET_VALUE reply |
//! | `closer_peers` | replies to GET_VALUE, GET_PROVIDERS, FIND_NODE |
//! | `provider_peers` | ADD_PROVIDER request, GET_VALUE / GET_PROVIDERS reply |
//! | `cluster_level_raw` | opaque; stored as `level + 1` so that 0 means unset |
//! | `error` | reply flag for rejected PUT_VALUE |
//!
//! ## Size Limits
//!
//! Frames whose declared length exceeds the configured ceiling are rejected
//! before any body bytes are read; callers close the stream on that error.
//! Deserialization runs under the same limit via bincode's `with_limit`.

use anyhow::{anyhow, bail, Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DhtError;
use crate::identity::{PeerId, PeerInfo};
use crate::records::Record;

/// Default frame ceiling (2 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Longest LEB128 encoding of a u64.
const MAX_UVARINT_LEN: usize = 10;

fn bincode_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit as u64)
        .with_fixint_encoding()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    PutValue,
    GetValue,
    AddProvider,
    GetProviders,
    FindNode,
    Ping,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::PutValue => "PUT_VALUE",
            MessageType::GetValue => "GET_VALUE",
            MessageType::AddProvider => "ADD_PROVIDER",
            MessageType::GetProviders => "GET_PROVIDERS",
            MessageType::FindNode => "FIND_NODE",
            MessageType::Ping => "PING",
        }
    }
}

/// Connection state of a peer as seen by the sender of a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Connectedness {
    #[default]
    NotConnected,
    Connected,
    CanConnect,
    CannotConnect,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePeer {
    pub id: PeerId,
    pub addrs: Vec<String>,
    pub connection: Connectedness,
}

impl WirePeer {
    pub fn new(info: PeerInfo, connection: Connectedness) -> Self {
        Self {
            id: info.id,
            addrs: info.addrs,
            connection,
        }
    }

    pub fn to_peer_info(&self) -> PeerInfo {
        PeerInfo::new(self.id, self.addrs.clone())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireErrorKind {
    Validation,
    Unsupported,
    Malformed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub message: String,
}

impl WireError {
    pub fn from_dht_error(err: &DhtError) -> Self {
        let kind = match err {
            DhtError::Validation(_) => WireErrorKind::Validation,
            DhtError::Unsupported(_) => WireErrorKind::Unsupported,
            _ => WireErrorKind::Malformed,
        };
        let message = match err {
            DhtError::Validation(msg) | DhtError::Unsupported(msg) => msg.clone(),
            other => other.to_string(),
        };
        Self { kind, message }
    }

    pub fn into_dht_error(self) -> DhtError {
        match self.kind {
            WireErrorKind::Validation => DhtError::Validation(self.message),
            WireErrorKind::Unsupported => DhtError::Unsupported(self.message),
            WireErrorKind::Malformed => DhtError::Transport(self.message),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub key: Vec<u8>,
    pub record: Option<Record>,
    pub closer_peers: Vec<WirePeer>,
    pub provider_peers: Vec<WirePeer>,
    pub cluster_level_raw: u32,
    pub error: Option<WireError>,
}

impl Message {
    pub fn new(msg_type: MessageType, key: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type,
            key: key.into(),
            record: None,
            closer_peers: Vec::new(),
            provider_peers: Vec::new(),
            cluster_level_raw: 0,
            error: None,
        }
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping, Vec::new())
    }

    pub fn with_record(mut self, record: Record) -> Self {
        self.record = Some(record);
        self
    }

    pub fn with_provider_peers(mut self, peers: Vec<WirePeer>) -> Self {
        self.provider_peers = peers;
        self
    }

    /// Decoded cluster level; both 0 (unset) and 1 decode to 0.
    pub fn cluster_level(&self) -> u32 {
        self.cluster_level_raw.saturating_sub(1)
    }

    pub fn set_cluster_level(&mut self, level: u32) {
        self.cluster_level_raw = level.saturating_add(1);
    }

    /// A reply skeleton: same type, key and cluster level as the request.
    pub fn reply_to(request: &Message) -> Self {
        let mut reply = Self::new(request.msg_type, request.key.clone());
        reply.cluster_level_raw = request.cluster_level_raw;
        reply
    }

    pub fn closer_peer_infos(&self) -> Vec<PeerInfo> {
        self.closer_peers.iter().map(WirePeer::to_peer_info).collect()
    }

    pub fn provider_peer_infos(&self) -> Vec<PeerInfo> {
        self.provider_peers.iter().map(WirePeer::to_peer_info).collect()
    }
}

// ============================================================================
// Unsigned varints
// ============================================================================

pub fn encode_uvarint(mut value: u64, buf: &mut Vec<u8>) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Decode a varint from the front of `buf`; returns the value and the
/// number of bytes consumed.
pub fn decode_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate().take(MAX_UVARINT_LEN) {
        let low = (byte & 0x7f) as u64;
        if i == MAX_UVARINT_LEN - 1 && low > 1 {
            return None;
        }
        value |= low << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Read one varint. `Ok(None)` means the stream ended cleanly before the
/// first byte.
pub async fn read_uvarint<R>(reader: &mut R) -> std::io::Result<Option<u64>>
where
    R: AsyncRead + Unpin,
{
    let mut value: u64 = 0;
    for i in 0..MAX_UVARINT_LEN {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && i == 0 => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let low = (byte & 0x7f) as u64;
        if i == MAX_UVARINT_LEN - 1 && low > 1 {
            break;
        }
        value |= low << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "varint overflows u64",
    ))
}

// ============================================================================
// Framing
// ============================================================================

/// Serialize `msg` into a length-prefixed frame.
pub fn encode_frame(msg: &Message, max_size: usize) -> Result<Vec<u8>> {
    let body = bincode_options(max_size)
        .serialize(msg)
        .map_err(|e| anyhow!("message exceeds {} byte limit: {}", max_size, e))?;
    if body.len() > max_size {
        bail!("message of {} bytes exceeds {} byte limit", body.len(), max_size);
    }
    let mut frame = Vec::with_capacity(body.len() + MAX_UVARINT_LEN);
    encode_uvarint(body.len() as u64, &mut frame);
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode_body(body: &[u8], max_size: usize) -> Result<Message> {
    if body.len() > max_size {
        bail!("message of {} bytes exceeds {} byte limit", body.len(), max_size);
    }
    bincode_options(max_size)
        .deserialize(body)
        .context("failed to decode message body")
}

pub async fn write_message<W>(writer: &mut W, msg: &Message, max_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg, max_size)?;
    writer.write_all(&frame).await.context("failed to write frame")?;
    writer.flush().await.context("failed to flush frame")?;
    Ok(())
}

/// Read one framed message. `Ok(None)` signals a clean end of stream.
pub async fn read_message<R>(reader: &mut R, max_size: usize) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let len = match read_uvarint(reader).await.context("failed to read frame length")? {
        Some(len) => len as usize,
        None => return Ok(None),
    };
    if len > max_size {
        bail!("incoming frame of {} bytes exceeds {} byte limit", len, max_size);
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .context("failed to read frame body")?;
    decode_body(&body, max_size).map(Some)
}
