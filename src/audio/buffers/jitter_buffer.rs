//! A bounded FIFO jitter buffer of decoded frames.
//!
//! Exactly one producer (the receive unit) pushes and exactly one consumer
//! (the playback unit) pops. Overflow evicts the oldest frame, so a burst
//! never grows the queue past its capacity and playback stays close to live.
//!
//! Once [`JitterBuffer::finish`] is called no further frames are accepted,
//! and the consumer sees `None` as soon as the queue is empty instead of
//! waiting for data that will never come.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::audio::frame::AudioFrame;

/// What happened to a pushed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Appended,
    /// The buffer was full; the oldest frame was discarded to make room.
    Evicted,
    /// The stream already ended; the frame was not stored.
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub len: usize,
    pub peak_len: usize,
    pub pushed: u64,
    pub evicted: u64,
    pub discarded: u64,
}

struct State {
    frames: VecDeque<AudioFrame>,
    finished: bool,
    peak_len: usize,
    pushed: u64,
    evicted: u64,
    discarded: u64,
}

pub struct JitterBuffer {
    state: Mutex<State>,
    /// Signalled on push and on finish.
    readable: Condvar,
    /// Signalled whenever the queue becomes empty.
    drained: Condvar,
    capacity: usize,
}

impl std::fmt::Debug for JitterBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitterBuffer")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

impl JitterBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "jitter buffer capacity must be positive");
        Self {
            state: Mutex::new(State {
                frames: VecDeque::with_capacity(capacity),
                finished: false,
                peak_len: 0,
                pushed: 0,
                evicted: 0,
                discarded: 0,
            }),
            readable: Condvar::new(),
            drained: Condvar::new(),
            capacity,
        }
    }

    /// Appends a frame, evicting the oldest one when full.
    ///
    /// Eviction and insertion happen under one lock, so the consumer never
    /// observes more than `capacity` frames.
    pub fn push(&self, frame: AudioFrame) -> PushOutcome {
        let mut state = self.state.lock().unwrap();
        if state.finished {
            debug!("JitterBuffer: dropping frame pushed after end of stream");
            return PushOutcome::Rejected;
        }

        let outcome = if state.frames.len() >= self.capacity {
            state.frames.pop_front();
            state.evicted += 1;
            warn!(
                "JitterBuffer full ({} frames), dropped oldest frame",
                self.capacity
            );
            PushOutcome::Evicted
        } else {
            PushOutcome::Appended
        };

        state.frames.push_back(frame);
        state.pushed += 1;
        state.peak_len = state.peak_len.max(state.frames.len());
        drop(state);

        self.readable.notify_one();
        outcome
    }

    /// Removes the oldest frame without waiting.
    #[cfg(test)]
    pub fn try_pop(&self) -> Option<AudioFrame> {
        let mut state = self.state.lock().unwrap();
        let frame = state.frames.pop_front();
        if frame.is_some() && state.frames.is_empty() {
            self.drained.notify_all();
        }
        frame
    }

    /// Removes the oldest frame, waiting up to `timeout` for one to arrive.
    ///
    /// Returns early with `None` when the buffer is empty and finished.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<AudioFrame> {
        let state = self.state.lock().unwrap();
        let (mut state, _) = self
            .readable
            .wait_timeout_while(state, timeout, |s| s.frames.is_empty() && !s.finished)
            .unwrap();

        let frame = state.frames.pop_front();
        if frame.is_some() && state.frames.is_empty() {
            self.drained.notify_all();
        }
        frame
    }

    /// Marks the stream as ended. Later pushes are rejected.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.finished = true;
        drop(state);
        self.readable.notify_all();
    }

    /// True once the stream has ended and every frame has been consumed.
    pub fn is_exhausted(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.finished && state.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until the buffer is empty.
    ///
    /// With `Some(timeout)` gives up after that long and returns `false`.
    pub fn wait_for_drain(&self, timeout: Option<Duration>) -> bool {
        let state = self.state.lock().unwrap();
        match timeout {
            None => {
                let _state = self
                    .drained
                    .wait_while(state, |s| !s.frames.is_empty())
                    .unwrap();
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                let mut state = state;
                while !state.frames.is_empty() {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    state = self.drained.wait_timeout(state, deadline - now).unwrap().0;
                }
                true
            }
        }
    }

    /// Throws away everything still queued. Returns how many frames were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let dropped = state.frames.len();
        state.frames.clear();
        state.discarded += dropped as u64;
        drop(state);
        self.drained.notify_all();
        dropped
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.state.lock().unwrap();
        BufferStats {
            len: state.frames.len(),
            peak_len: state.peak_len,
            pushed: state.pushed,
            evicted: state.evicted,
            discarded: state.discarded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn tagged(tag: i16) -> AudioFrame {
        AudioFrame::new(vec![tag; 4], 4).unwrap()
    }

    fn tag_of(frame: &AudioFrame) -> i16 {
        frame.samples()[0]
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let buffer = JitterBuffer::new(10);

        for tag in 1..=10 {
            assert_eq!(buffer.push(tagged(tag)), PushOutcome::Appended);
        }
        assert_eq!(buffer.len(), 10);

        assert_eq!(buffer.push(tagged(11)), PushOutcome::Evicted);
        assert_eq!(buffer.len(), 10);

        let remaining: Vec<i16> = std::iter::from_fn(|| buffer.try_pop())
            .map(|f| tag_of(&f))
            .collect();
        assert_eq!(remaining, (2..=11).collect::<Vec<_>>());
        assert_eq!(buffer.stats().evicted, 1);
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let buffer = JitterBuffer::new(3);

        for round in 0..20i16 {
            // Bursts of varying size interleaved with occasional pops.
            for tag in 0..(round % 7) {
                buffer.push(tagged(round * 10 + tag));
                assert!(buffer.len() <= 3);
            }
            if round % 3 == 0 {
                buffer.try_pop();
            }
            assert!(buffer.len() <= 3);
        }
        assert_eq!(buffer.stats().peak_len, 3);
    }

    #[test]
    fn test_pop_on_empty_waits_then_returns_none() {
        let buffer = JitterBuffer::new(4);
        let started = Instant::now();
        assert!(buffer.pop_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_pop_returns_immediately_when_finished() {
        let buffer = JitterBuffer::new(4);
        buffer.finish();
        let started = Instant::now();
        assert!(buffer.pop_timeout(Duration::from_secs(5)).is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(buffer.is_exhausted());
    }

    #[test]
    fn test_push_after_finish_is_rejected() {
        let buffer = JitterBuffer::new(4);
        buffer.push(tagged(1));
        buffer.finish();

        assert_eq!(buffer.push(tagged(2)), PushOutcome::Rejected);
        assert_eq!(buffer.len(), 1);
        assert!(!buffer.is_exhausted());

        assert_eq!(tag_of(&buffer.pop_timeout(Duration::ZERO).unwrap()), 1);
        assert!(buffer.is_exhausted());
    }

    #[test]
    fn test_blocked_pop_wakes_on_push() {
        let buffer = Arc::new(JitterBuffer::new(4));
        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || buffer.pop_timeout(Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        buffer.push(tagged(42));

        let frame = consumer.join().unwrap().expect("consumer should be woken");
        assert_eq!(tag_of(&frame), 42);
    }

    #[test]
    fn test_wait_for_drain() {
        let buffer = Arc::new(JitterBuffer::new(8));
        for tag in 0..5 {
            buffer.push(tagged(tag));
        }

        assert!(!buffer.wait_for_drain(Some(Duration::from_millis(20))));

        let consumer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                while buffer.pop_timeout(Duration::from_millis(50)).is_some() {
                    thread::sleep(Duration::from_millis(2));
                }
            })
        };

        assert!(buffer.wait_for_drain(Some(Duration::from_secs(5))));
        assert!(buffer.is_empty());
        consumer.join().unwrap();
    }

    #[test]
    fn test_clear_counts_discarded_frames() {
        let buffer = JitterBuffer::new(8);
        for tag in 0..3 {
            buffer.push(tagged(tag));
        }
        assert_eq!(buffer.clear(), 3);
        assert!(buffer.wait_for_drain(None));
        assert_eq!(buffer.stats().discarded, 3);
    }

    #[test]
    fn test_concurrent_order_is_preserved() {
        let buffer = Arc::new(JitterBuffer::new(4));

        let producer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for tag in 0..500i16 {
                    buffer.push(tagged(tag));
                    if tag % 50 == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
                buffer.finish();
            })
        };

        let mut seen = Vec::new();
        loop {
            match buffer.pop_timeout(Duration::from_millis(100)) {
                Some(frame) => seen.push(tag_of(&frame)),
                None if buffer.is_exhausted() => break,
                None => {}
            }
        }
        producer.join().unwrap();

        // Eviction may skip frames but never reorders them.
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*seen.last().unwrap(), 499);
        let stats = buffer.stats();
        assert_eq!(seen.len() as u64 + stats.evicted, 500);
    }
}
