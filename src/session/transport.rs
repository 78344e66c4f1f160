//! Transport seam between session logic and the WebSocket layer.
//!
//! Sessions only see [`Connector`] and [`Connection`]; the WebSocket
//! implementation lives in [`crate::io::network`] and tests use in-memory fakes.

use async_trait::async_trait;

use super::packet::StreamPacket;
use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseKind {
    /// Close frame with the normal status code.
    Normal,
    Abnormal { code: Option<u16>, reason: String },
}

/// One inbound event on an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Packet(StreamPacket),
    /// A message that is not a valid packet; the connection stays open.
    Malformed(String),
    Closed(CloseKind),
}

#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, packet: &StreamPacket) -> Result<(), TransportError>;

    /// Waits for the next data message. Control frames are handled internally.
    async fn recv(&mut self) -> Result<Incoming, TransportError>;

    /// Closes with the normal status code when `normal`, otherwise with a going-away code.
    async fn close(&mut self, normal: bool) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Conn: Connection;

    async fn connect(&self) -> Result<Self::Conn, TransportError>;
}
