use std::time::Duration;

use anyhow::Result;

/// Sample rates the Opus codec accepts.
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Whole-millisecond Opus frame durations.
pub const SUPPORTED_FRAME_DURATIONS_MS: [u32; 4] = [10, 20, 40, 60];

/// Shape of the PCM stream shared by sender and receiver.
///
/// Audio is always mono signed 16-bit. `channels` exists so the value can be
/// carried through configuration and rejected when it is anything but 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_duration_ms: 60,
        }
    }
}

impl AudioFormat {
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            anyhow::bail!(
                "Unsupported sample rate {}Hz, expected one of {:?}",
                self.sample_rate,
                SUPPORTED_SAMPLE_RATES
            );
        }
        if self.channels != 1 {
            anyhow::bail!("Only mono audio is supported, got {} channels", self.channels);
        }
        if !SUPPORTED_FRAME_DURATIONS_MS.contains(&self.frame_duration_ms) {
            anyhow::bail!(
                "Unsupported frame duration {}ms, expected one of {:?}",
                self.frame_duration_ms,
                SUPPORTED_FRAME_DURATIONS_MS
            );
        }
        Ok(())
    }

    /// Number of samples in every frame handed to the codec or the sink.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }
}

/// One fixed-length block of mono 16-bit PCM.
///
/// The length is checked on construction, so every frame that exists has
/// exactly the sample count its format demands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    /// Create a frame from raw samples.
    ///
    /// Returns an error if `samples.len()` differs from `frame_len`.
    pub fn new(samples: Vec<i16>, frame_len: usize) -> Result<Self> {
        if samples.len() != frame_len {
            anyhow::bail!(
                "Frame has {} samples, expected exactly {}",
                samples.len(),
                frame_len
            );
        }
        Ok(Self { samples })
    }

    /// Build a full-length frame from a possibly short block, zero-padding the tail.
    pub fn padded(block: &[i16], frame_len: usize) -> Self {
        let mut samples = Vec::with_capacity(frame_len);
        samples.extend_from_slice(&block[..block.len().min(frame_len)]);
        samples.resize(frame_len, 0);
        Self { samples }
    }

    /// Access the underlying raw sample data.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }
}
