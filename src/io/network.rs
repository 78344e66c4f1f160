//! Network I/O over WebSocket.
//!
//! - [`WsConnector`] - dials the sender from the receiving side
//! - [`WsListener`] - accepts receivers on the sending side
//! - [`WsConnection`] - one upgraded socket speaking [`StreamPacket`] messages
//!
//! # Protocol
//!
//! Each data message is a binary WebSocket message carrying one
//! `rkyv`-serialized [`StreamPacket`]. Text messages and binary messages
//! that do not deserialize are reported as [`Incoming::Malformed`].
//! A close frame with code 1000 ends the stream cleanly; every other way a
//! connection can end is abnormal.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};
use tracing::{debug, info};
use url::Url;

use crate::error::TransportError;
use crate::session::packet::StreamPacket;
use crate::session::transport::{CloseKind, Connection, Connector, Incoming};

pub struct WsConnection<S> {
    ws: WebSocketStream<S>,
    peer: String,
    closed: bool,
}

impl<S> WsConnection<S> {
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl<S> Connection for WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, packet: &StreamPacket) -> Result<(), TransportError> {
        let bytes = packet.to_bytes()?;
        self.ws.send(Message::Binary(bytes.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Incoming, TransportError> {
        loop {
            let Some(message) = self.ws.next().await else {
                self.closed = true;
                return Err(TransportError::ConnectionLost);
            };

            match message? {
                Message::Binary(bytes) => {
                    return Ok(match StreamPacket::from_bytes(&bytes) {
                        Ok(packet) => Incoming::Packet(packet),
                        Err(e) => Incoming::Malformed(e.to_string()),
                    });
                }
                Message::Text(text) => {
                    return Ok(Incoming::Malformed(format!(
                        "unexpected text message ({} bytes)",
                        text.as_str().len()
                    )));
                }
                Message::Close(frame) => {
                    self.closed = true;
                    let kind = match frame {
                        Some(f) if f.code == CloseCode::Normal => CloseKind::Normal,
                        Some(f) => CloseKind::Abnormal {
                            code: Some(u16::from(f.code)),
                            reason: f.reason.to_string(),
                        },
                        None => CloseKind::Abnormal {
                            code: None,
                            reason: "close frame without status".to_string(),
                        },
                    };
                    return Ok(Incoming::Closed(kind));
                }
                // Pings are answered by tungstenite on the next read or write.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self, normal: bool) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let frame = if normal {
            CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::from_static("end of stream"),
            }
        } else {
            CloseFrame {
                code: CloseCode::Away,
                reason: Utf8Bytes::from_static("going away"),
            }
        };
        debug!("Closing connection to {} ({:?})", self.peer, frame.code);

        match self.ws.close(Some(frame)).await {
            Ok(())
            | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Dials a fixed `ws://` address.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Conn = WsConnection<MaybeTlsStream<TcpStream>>;

    async fn connect(&self) -> Result<Self::Conn, TransportError> {
        let (ws, _response) =
            connect_async(self.url.as_str())
                .await
                .map_err(|source| TransportError::Connect {
                    addr: self.url.to_string(),
                    source,
                })?;
        info!("Connected to {}", self.url);
        Ok(WsConnection {
            ws,
            peer: self.url.to_string(),
            closed: false,
        })
    }
}

/// TCP listener that upgrades each accepted socket to a WebSocket.
pub struct WsListener {
    listener: TcpListener,
}

impl WsListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on ws://{}", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<WsConnection<TcpStream>, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        let ws = accept_async(stream).await?;
        info!("Client connected: {}", peer);
        Ok(WsConnection {
            ws,
            peer: peer.to_string(),
            closed: false,
        })
    }
}
