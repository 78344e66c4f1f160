use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use url::Url;

use crate::audio::frame::AudioFormat;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8765";
pub const DEFAULT_CONNECT_ADDR: &str = "127.0.0.1:8765";

/// Wait between a failed attempt and the next connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// Doubles per consecutive failure, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed(Duration::from_secs(3))
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(d) => d,
            BackoffPolicy::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                base.checked_mul(1u32 << shift).unwrap_or(max).min(max)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub format: AudioFormat,
    pub address: Url,
    pub max_buffer_frames: usize,
    pub max_retries: u32,
    /// Bound on one connection attempt, handshake included.
    pub connect_timeout: Duration,
    pub receive_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// `None` waits for playback to consume every buffered frame.
    pub drain_timeout: Option<Duration>,
    /// How long the playback loop waits on an empty buffer before re-checking.
    pub idle_wait: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            address: ws_url(DEFAULT_CONNECT_ADDR).expect("default address is valid"),
            max_buffer_frames: 10,
            max_retries: 3,
            connect_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            drain_timeout: Some(Duration::from_secs(10)),
            idle_wait: Duration::from_millis(100),
        }
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<()> {
        self.format.validate()?;
        if self.max_buffer_frames == 0 {
            bail!("Jitter buffer must hold at least one frame");
        }
        if self.connect_timeout.is_zero() {
            bail!("Connect timeout must be positive");
        }
        if self.receive_timeout.is_zero() {
            bail!("Receive timeout must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub format: AudioFormat,
    pub listen: SocketAddr,
    /// Exit after the first session instead of accepting another client.
    pub once: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            listen: DEFAULT_LISTEN_ADDR.parse().expect("default address is valid"),
            once: false,
        }
    }
}

impl SenderConfig {
    pub fn validate(&self) -> Result<()> {
        self.format.validate()
    }
}

/// Accepts `host:port` or a full `ws://` URL.
pub fn ws_url(address: &str) -> Result<Url> {
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("ws://{address}")
    };

    let url = Url::parse(&candidate).with_context(|| format!("Invalid address {address:?}"))?;
    if url.scheme() != "ws" {
        bail!("Unsupported scheme {:?}, expected ws://", url.scheme());
    }
    if url.host_str().is_none() {
        bail!("Address {address:?} has no host");
    }
    if url.port().is_none() {
        bail!("Address {address:?} has no port");
    }
    Ok(url)
}
