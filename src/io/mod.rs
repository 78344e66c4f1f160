//! Hardware and network I/O.
//!
//! Concrete implementations of the seams the session code runs on:
//!
//! - [`audio`] - output sinks for speaker playback via cpal, or a null output
//! - [`network`] - WebSocket transport for stream packets

pub mod audio;
pub mod network;

pub use audio::{OutputKind, open_sink};
pub use network::{WsConnector, WsListener};
