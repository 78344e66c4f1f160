//! Audio output devices.
//!
//! Provides:
//! - [`AudioSink`] - blocking sink accepting one PCM block per call
//! - [`CpalSink`] - speaker playback via cpal, fed through an rtrb ring
//! - [`NullSink`] - discards audio at real-time cadence (headless runs)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, error, info};

use crate::audio::frame::AudioFormat;

const RING_FRAMES: usize = 4;
const WRITE_POLL: Duration = Duration::from_millis(2);
const WRITE_TIMEOUT_FRAMES: u32 = 4;

/// Destination for fixed-size blocks of mono 16-bit PCM.
///
/// `write` blocks at the device's own cadence. Dropping the sink releases the device.
pub trait AudioSink {
    fn write(&mut self, block: &[i16]) -> Result<()>;

    /// Waits for samples already handed over to reach the device.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputKind {
    /// The system's default output device.
    #[default]
    Default,
    /// Discard audio while keeping real-time pacing.
    Null,
}

pub fn open_sink(kind: OutputKind, format: &AudioFormat) -> Result<Box<dyn AudioSink>> {
    match kind {
        OutputKind::Default => Ok(Box::new(CpalSink::open(format)?)),
        OutputKind::Null => Ok(Box::new(NullSink::new(format.frame_duration()))),
    }
}

/// Plays audio to the default output device (speakers).
///
/// Mono samples are duplicated across all device channels. The device
/// callback pulls from an SPSC ring; when the ring is empty it plays silence.
pub struct CpalSink {
    producer: Producer<i16>,
    capacity: usize,
    write_timeout: Duration,
    tail: Duration,
    stream_failed: Arc<AtomicBool>,
    _stream: Stream,
}

impl CpalSink {
    pub fn open(format: &AudioFormat) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("No default output device available")?;

        info!(
            "Using output device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let supported = device
            .supported_output_configs()
            .context("Failed to query output configs")?
            .filter(|c| {
                c.min_sample_rate().0 <= format.sample_rate
                    && c.max_sample_rate().0 >= format.sample_rate
            })
            .min_by_key(|c| c.channels())
            .ok_or_else(|| {
                anyhow!(
                    "Output device does not support {}Hz playback",
                    format.sample_rate
                )
            })?
            .with_sample_rate(cpal::SampleRate(format.sample_rate));
        debug!("Output config: {supported:#?}");

        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: BufferSize::Default,
        };

        let capacity = format.samples_per_frame() * RING_FRAMES;
        let (producer, consumer) = RingBuffer::<i16>::new(capacity);
        let stream_failed = Arc::new(AtomicBool::new(false));

        let stream = match supported.sample_format() {
            SampleFormat::I16 => {
                build_output_stream::<i16>(&device, &config, consumer, stream_failed.clone())?
            }
            SampleFormat::U16 => {
                build_output_stream::<u16>(&device, &config, consumer, stream_failed.clone())?
            }
            SampleFormat::F32 => {
                build_output_stream::<f32>(&device, &config, consumer, stream_failed.clone())?
            }
            other => anyhow::bail!("Unsupported sample format: {:?}", other),
        };

        stream.play().context("Failed to start output stream")?;
        info!(
            "Audio playback started ({}Hz, {} device channel(s))",
            format.sample_rate, config.channels
        );

        Ok(Self {
            producer,
            capacity,
            write_timeout: format.frame_duration() * WRITE_TIMEOUT_FRAMES,
            tail: format.frame_duration(),
            stream_failed,
            _stream: stream,
        })
    }
}

fn build_output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: Consumer<i16>,
    stream_failed: Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = config.channels as usize;
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = T::from_sample_(consumer.pop().unwrap_or(0));
                    for slot in frame.iter_mut() {
                        *slot = sample;
                    }
                }
            },
            move |err| {
                error!("An error occurred on the output audio stream: {}", err);
                stream_failed.store(true, Ordering::Release);
            },
            None,
        )
        .context("Failed to build output stream")?;
    Ok(stream)
}

impl AudioSink for CpalSink {
    fn write(&mut self, block: &[i16]) -> Result<()> {
        if self.stream_failed.load(Ordering::Acquire) {
            anyhow::bail!("Output stream reported an error");
        }

        let deadline = Instant::now() + self.write_timeout;
        let mut remaining = block;
        while !remaining.is_empty() {
            let n = self.producer.slots().min(remaining.len());
            if n > 0 {
                let chunk = self
                    .producer
                    .write_chunk_uninit(n)
                    .map_err(|e| anyhow!("Ring buffer write failed: {e}"))?;
                chunk.fill_from_iter(remaining[..n].iter().copied());
                remaining = &remaining[n..];
                continue;
            }
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "Output device stalled, {} of {} samples not written",
                    remaining.len(),
                    block.len()
                );
            }
            thread::sleep(WRITE_POLL);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.write_timeout;
        while self.producer.slots() < self.capacity {
            if Instant::now() >= deadline {
                anyhow::bail!("Output device did not consume the remaining samples");
            }
            thread::sleep(WRITE_POLL);
        }
        // Let the device's own buffer play out.
        thread::sleep(self.tail);
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        info!("Output device released");
    }
}

/// Accepts blocks and throws them away, one block per frame duration.
pub struct NullSink {
    pacing: Duration,
    blocks: u64,
}

impl NullSink {
    pub fn new(pacing: Duration) -> Self {
        Self { pacing, blocks: 0 }
    }
}

impl AudioSink for NullSink {
    fn write(&mut self, _block: &[i16]) -> Result<()> {
        self.blocks += 1;
        if !self.pacing.is_zero() {
            thread::sleep(self.pacing);
        }
        Ok(())
    }
}

impl Drop for NullSink {
    fn drop(&mut self) {
        debug!("Null output released after {} blocks", self.blocks);
    }
}
