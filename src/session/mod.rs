//! Streaming sessions between one sender and one receiver.
//!
//! - [`state`] - connection lifecycle state machine with retry and backoff
//! - [`packet`] - wire format of data messages
//! - [`transport`] - connector/connection seam the sessions run on
//! - [`pacer`] - real-time frame pacing on the sending side
//! - [`sender`] - accept loop and per-client send session
//! - [`receiver`] - receive unit plus playback unit sharing a jitter buffer

pub mod config;
pub mod pacer;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod state;
pub mod transport;

pub use config::{BackoffPolicy, ReceiverConfig, SenderConfig};
pub use receiver::Receiver;
pub use sender::serve;
