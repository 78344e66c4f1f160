//! Segmentation of canonical PCM into fixed-duration frames.

use std::sync::Arc;

use super::frame::AudioFrame;

/// A finite PCM stream cut into frames of `frame_len` samples.
///
/// The PCM is held behind an `Arc`, so every call to [`FrameSource::frames`]
/// starts a fresh pass from the first sample. This is how each new
/// connection gets the whole stream.
#[derive(Debug, Clone)]
pub struct FrameSource {
    pcm: Arc<[i16]>,
    frame_len: usize,
}

impl FrameSource {
    pub fn new(pcm: impl Into<Arc<[i16]>>, frame_len: usize) -> Self {
        assert!(frame_len > 0, "frame length must be positive");
        Self {
            pcm: pcm.into(),
            frame_len,
        }
    }

    /// Lazily yields frames; only the last one is zero-padded.
    pub fn frames(&self) -> Frames {
        Frames {
            pcm: self.pcm.clone(),
            frame_len: self.frame_len,
            pos: 0,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.pcm.len().div_ceil(self.frame_len)
    }

    pub fn total_samples(&self) -> usize {
        self.pcm.len()
    }
}

pub struct Frames {
    pcm: Arc<[i16]>,
    frame_len: usize,
    pos: usize,
}

impl Iterator for Frames {
    type Item = AudioFrame;

    fn next(&mut self) -> Option<AudioFrame> {
        if self.pos >= self.pcm.len() {
            return None;
        }
        let end = (self.pos + self.frame_len).min(self.pcm.len());
        let frame = AudioFrame::padded(&self.pcm[self.pos..end], self.frame_len);
        self.pos = end;
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.pcm.len() - self.pos).div_ceil(self.frame_len);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Frames {}
