//! Error types for caravela

use std::fmt;

#[derive(Debug)]
pub enum NodeError {
    /// The frame could not be decoded: short prefix, bad UTF-8, malformed
    /// JSON or an unknown message type. The offending connection is closed.
    InvalidFrame(String),
    /// The declared frame length exceeds the protocol cap.
    FrameTooLarge(usize),
    /// A well-formed frame carried a payload of the wrong shape.
    InvalidPayload(String),
    /// Dial, write or read against a peer failed or timed out.
    PeerUnreachable(String),
    /// The chain-sync aggregation window elapsed with no usable candidate.
    SyncTimeout,
    Config(String),
    Io(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeError::InvalidFrame(msg) => write!(f, "invalid frame: {}", msg),
            NodeError::FrameTooLarge(len) => write!(f, "frame of {} bytes exceeds limit", len),
            NodeError::InvalidPayload(msg) => write!(f, "invalid payload: {}", msg),
            NodeError::PeerUnreachable(msg) => write!(f, "peer unreachable: {}", msg),
            NodeError::SyncTimeout => write!(f, "chain sync timed out"),
            NodeError::Config(msg) => write!(f, "config error: {}", msg),
            NodeError::Io(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::InvalidFrame(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, NodeError>;
