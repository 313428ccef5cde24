//! Wire protocol: message taxonomy and length-prefixed JSON framing.
//!
//! A frame is `[4 bytes big-endian length N][N bytes UTF-8 JSON]`. The JSON
//! is the envelope `{"type": ..., "payload": ..., "sender": "host:port"}`;
//! the `type` string discriminates the payload shape. Unknown fields are
//! ignored, unknown types and malformed frames are decode errors and cost
//! the sender its connection.

use crate::block::Block;
use crate::blockchain::ChainSnapshot;
use crate::error::{NodeError, Result};
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame, guarding against resource exhaustion.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// P2P message taxonomy. `NEW_TRANSACTION` and `NEW_BLOCK` are one-shot
/// broadcasts; the rest are request/response pairs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    NewTransaction { transaction: Transaction },
    NewBlock { block: Block },
    RequestChain {},
    ResponseChain { blockchain: ChainSnapshot },
    Ping {},
    Pong {},
    DiscoverPeers {},
    PeersList { peers: Vec<String> },
}

impl Message {
    /// Wire name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::NewTransaction { .. } => "NEW_TRANSACTION",
            Message::NewBlock { .. } => "NEW_BLOCK",
            Message::RequestChain {} => "REQUEST_CHAIN",
            Message::ResponseChain { .. } => "RESPONSE_CHAIN",
            Message::Ping {} => "PING",
            Message::Pong {} => "PONG",
            Message::DiscoverPeers {} => "DISCOVER_PEERS",
            Message::PeersList { .. } => "PEERS_LIST",
        }
    }
}

/// One framed unit on the wire: a message plus the sender's listen address,
/// which receivers use for peer learning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: Message,
    #[serde(default)]
    pub sender: String,
}

impl Envelope {
    pub fn new(message: Message, sender: &str) -> Self {
        Envelope {
            message,
            sender: sender.to_string(),
        }
    }
}

/// Serialize an envelope into a ready-to-send frame.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(NodeError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body (length prefix already stripped).
pub fn decode(body: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(body).map_err(|err| NodeError::InvalidFrame(err.to_string()))
}

pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed envelope. Fails on a short prefix, an oversized length
/// declaration, or a body that does not decode.
pub async fn read_frame<R>(reader: &mut R) -> Result<Envelope>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NodeError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode(&body)
}
