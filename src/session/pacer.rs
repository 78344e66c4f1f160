//! Real-time pacing of encoded frames.

use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior, interval};

use super::packet::StreamPacket;
use crate::audio::frame_source::Frames;
use crate::audio::opus::FrameEncoder;
use crate::error::CodecError;

/// Yields one packet per frame duration: every frame of the source in
/// order, then a single `EndOfStream`, then nothing.
///
/// Encoding happens after the tick so a slow encoder delays the stream
/// rather than bursting it.
pub struct Pacer<E> {
    frames: Frames,
    encoder: E,
    ticker: Interval,
    sent: u64,
    finished: bool,
}

impl<E: FrameEncoder> Pacer<E> {
    pub fn new(frames: Frames, encoder: E, frame_duration: Duration) -> Self {
        let mut ticker = interval(frame_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            frames,
            encoder,
            ticker,
            sent: 0,
            finished: false,
        }
    }

    /// Number of frames emitted so far, not counting the end marker.
    pub fn frames_sent(&self) -> u64 {
        self.sent
    }

    pub async fn next(&mut self) -> Result<Option<StreamPacket>, CodecError> {
        if self.finished {
            return Ok(None);
        }

        self.ticker.tick().await;
        match self.frames.next() {
            Some(frame) => {
                let payload = self.encoder.encode(&frame)?;
                self.sent += 1;
                Ok(Some(StreamPacket::Frame(payload)))
            }
            None => {
                self.finished = true;
                Ok(Some(StreamPacket::EndOfStream))
            }
        }
    }
}
