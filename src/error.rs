//! Typed errors for the transport and codec seams.
//!
//! Orchestration code composes these into `anyhow::Result` with context.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed without a close frame")]
    ConnectionLost,

    #[error("packet serialization failed: {0}")]
    Serialize(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to create opus {role}: {source}")]
    Create {
        role: &'static str,
        #[source]
        source: opus::Error,
    },

    #[error("opus encoding failed: {0}")]
    Encode(#[source] opus::Error),

    #[error("opus decoding failed: {0}")]
    Decode(#[source] opus::Error),

    #[error("frame has {actual} samples, expected {expected}")]
    FrameLength { expected: usize, actual: usize },
}
