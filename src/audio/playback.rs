//! Playback unit: drains the jitter buffer into an output sink.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::buffers::JitterBuffer;
use crate::io::audio::AudioSink;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub frames_played: u64,
    pub write_errors: u64,
}

/// Pops frames in arrival order and writes them to a sink.
///
/// Runs until the buffer has been finished by the receive side and every
/// queued frame has been written. A failed write skips that one frame.
pub struct PlaybackLoop {
    buffer: Arc<JitterBuffer>,
    idle_wait: Duration,
}

impl PlaybackLoop {
    pub fn new(buffer: Arc<JitterBuffer>, idle_wait: Duration) -> Self {
        Self { buffer, idle_wait }
    }

    pub fn run<S: AudioSink + ?Sized>(&self, sink: &mut S) -> PlaybackStats {
        let mut stats = PlaybackStats::default();
        info!("Playback loop started");

        loop {
            match self.buffer.pop_timeout(self.idle_wait) {
                Some(frame) => match sink.write(frame.samples()) {
                    Ok(()) => stats.frames_played += 1,
                    Err(e) => {
                        stats.write_errors += 1;
                        warn!("Playback write failed, skipping frame: {:#}", e);
                    }
                },
                // Pushes are rejected after finish, so this cannot race a late frame.
                None if self.buffer.is_exhausted() => break,
                None => debug!("Playback idle, buffer empty"),
            }
        }

        if let Err(e) = sink.flush() {
            warn!("Failed to flush output: {:#}", e);
        }

        info!(
            "Playback loop finished: {} frames played, {} write errors",
            stats.frames_played, stats.write_errors
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::AudioFrame;
    use std::thread;

    #[derive(Default)]
    struct RecordingSink {
        blocks: Vec<Vec<i16>>,
        fail_on: Vec<usize>,
        calls: usize,
        flushed: bool,
    }

    impl AudioSink for RecordingSink {
        fn write(&mut self, block: &[i16]) -> anyhow::Result<()> {
            let call = self.calls;
            self.calls += 1;
            if self.fail_on.contains(&call) {
                anyhow::bail!("simulated device glitch");
            }
            self.blocks.push(block.to_vec());
            Ok(())
        }

        fn flush(&mut self) -> anyhow::Result<()> {
            self.flushed = true;
            Ok(())
        }
    }

    fn tagged(tag: i16) -> AudioFrame {
        AudioFrame::new(vec![tag; 8], 8).unwrap()
    }

    #[test]
    fn test_plays_in_order_and_stops_when_exhausted() {
        let buffer = Arc::new(JitterBuffer::new(16));
        for tag in 1..=5 {
            buffer.push(tagged(tag));
        }
        buffer.finish();

        let mut sink = RecordingSink::default();
        let stats = PlaybackLoop::new(buffer.clone(), Duration::from_millis(5)).run(&mut sink);

        assert_eq!(stats.frames_played, 5);
        let tags: Vec<i16> = sink.blocks.iter().map(|b| b[0]).collect();
        assert_eq!(tags, vec![1, 2, 3, 4, 5]);
        assert!(sink.blocks.iter().all(|b| b.len() == 8));
        assert!(sink.flushed);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_write_failure_does_not_stop_playback() {
        let buffer = Arc::new(JitterBuffer::new(16));
        for tag in 1..=4 {
            buffer.push(tagged(tag));
        }
        buffer.finish();

        let mut sink = RecordingSink {
            fail_on: vec![1],
            ..Default::default()
        };
        let stats = PlaybackLoop::new(buffer, Duration::from_millis(5)).run(&mut sink);

        assert_eq!(stats.write_errors, 1);
        assert_eq!(stats.frames_played, 3);
        let tags: Vec<i16> = sink.blocks.iter().map(|b| b[0]).collect();
        assert_eq!(tags, vec![1, 3, 4]);
    }

    #[test]
    fn test_keeps_running_until_finished() {
        let buffer = Arc::new(JitterBuffer::new(16));
        let player = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let mut sink = RecordingSink::default();
                let stats = PlaybackLoop::new(buffer, Duration::from_millis(2)).run(&mut sink);
                (stats, sink.blocks.len())
            })
        };

        // Gaps longer than the idle wait must not end playback.
        for tag in 0..3 {
            thread::sleep(Duration::from_millis(20));
            buffer.push(tagged(tag));
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!player.is_finished());

        buffer.finish();
        let (stats, blocks) = player.join().unwrap();
        assert_eq!(stats.frames_played, 3);
        assert_eq!(blocks, 3);
    }
}
