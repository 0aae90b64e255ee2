//! # Wire Protocol Messages
//!
//! Every peer session speaks the same duplex protocol: length-prefixed
//! bincode [`Frame`]s, each either a request or a response. Requests and
//! responses are matched by a per-session `request_id`; nothing else about
//! ordering is guaranteed.
//!
//! | Shape | Contents |
//! |-------|----------|
//! | [`RpcRequest`] | request id, [`Operation`], sender [`PeerInfo`], target [`Key`], optional payload |
//! | [`RpcResponse`] | request id, sender, success flag, optional payload, peer list |
//!
//! Deserialization always goes through the bounded options so a malformed
//! or hostile length can never balloon an allocation.

use anyhow::{Context, Result};
use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::key::Key;
use crate::peer::PeerInfo;

/// Maximum size of a stored value (1 MiB). Larger values should be chunked
/// by the caller.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum size of one framed message: a value plus headroom for the
/// envelope, sender info and peer list.
pub const MAX_FRAME_SIZE: usize = MAX_VALUE_SIZE + 64 * 1024;

/// Deserialization buffer cap, slightly above the frame limit.
pub const MAX_DESERIALIZE_SIZE: u64 = MAX_FRAME_SIZE as u64 + 4096;

/// The four primitive operations a peer serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Ping = 0,
    Store = 1,
    FindPeer = 2,
    FindValue = 3,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Unique within the issuing session, monotonically increasing.
    pub request_id: u64,
    pub op: Operation,
    /// The requester's self-description; receivers feed it into routing.
    pub sender: PeerInfo,
    pub target: Key,
    pub data: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub request_id: u64,
    pub sender: PeerInfo,
    pub success: bool,
    pub data: Option<Vec<u8>>,
    pub peers: Vec<PeerInfo>,
}

/// Envelope distinguishing the two directions on one duplex stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Frame {
    Request(RpcRequest),
    Response(RpcResponse),
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Bounded deserialization; use this instead of raw `bincode::deserialize`.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_frame(frame: &Frame) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(frame)
}

/// Write one frame: u32 big-endian length prefix, then the bincode body.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = serialize_frame(frame).context("failed to serialize frame")?;
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream; an
/// oversized or undecodable frame is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let frame = deserialize_bounded(&body).context("failed to deserialize frame")?;
    Ok(Some(frame))
}
