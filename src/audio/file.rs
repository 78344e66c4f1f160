//! Audio file decoding using symphonia.
//!
//! Provides [`AudioFileReader`] for decoding common audio formats (mp3, flac, wav, ogg, aac)
//! into the canonical mono 16-bit PCM stream at the target sample rate.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use dasp_sample::Sample;
use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info};

const RESAMPLE_CHUNK_SIZE: usize = 1024;

/// Averages all channels of a decoded packet into `output`.
fn mix_down(decoded: AudioBufferRef<'_>, output: &mut Vec<f64>) {
    let spec = *decoded.spec();
    let channels = spec.channels.count().max(1);
    let mut interleaved = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
    interleaved.copy_interleaved_ref(decoded);

    for frame in interleaved.samples().chunks_exact(channels) {
        let sum: f64 = frame.iter().map(|&s| s as f64).sum();
        output.push(sum / channels as f64);
    }
}

#[derive(Debug, Clone)]
pub struct AudioFileInfo {
    pub sample_rate: u32,
    pub channels: usize,
    pub duration_secs: Option<f64>,
    pub file_name: String,
}

pub struct AudioFileReader {
    format: Box<dyn symphonia::core::formats::FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    pub info: AudioFileInfo,
}

impl AudioFileReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let file = File::open(path)
            .with_context(|| format!("Failed to open audio file {}", path.display()))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .context("Failed to probe audio format")?;

        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| anyhow!("No supported audio track found"))?;

        let track_id = track.id;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| anyhow!("Unknown sample rate"))?;

        let channels = track
            .codec_params
            .channels
            .map(|c| c.count())
            .unwrap_or(1);

        let duration_secs = track
            .codec_params
            .n_frames
            .map(|frames| frames as f64 / sample_rate as f64);

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .context("Failed to create decoder")?;

        let info = AudioFileInfo {
            sample_rate,
            channels,
            duration_secs,
            file_name,
        };

        info!(
            "Opened {} ({}Hz, {} channel(s), {:?}s)",
            info.file_name, info.sample_rate, info.channels, info.duration_secs
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            info,
        })
    }

    /// Decodes the whole file into mono 16-bit PCM at `target_rate`.
    pub fn decode_mono_resampled(mut self, target_rate: u32) -> Result<Vec<i16>> {
        let mut mono: Vec<f64> = Vec::new();

        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(symphonia::core::errors::Error::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(symphonia::core::errors::Error::ResetRequired) => break,
                Err(e) => return Err(e).context("Failed to read packet"),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => mix_down(decoded, &mut mono),
                Err(symphonia::core::errors::Error::DecodeError(e)) => {
                    debug!("Skipping undecodable packet: {}", e);
                }
                Err(e) => return Err(e).context("Failed to decode packet"),
            }
        }

        let resampled = resample(&mono, self.info.sample_rate, target_rate)?;

        Ok(resampled
            .into_iter()
            .map(|s| s.clamp(-1.0, 1.0).to_sample::<i16>())
            .collect())
    }
}

/// Loads any supported audio file as canonical mono PCM at `sample_rate`.
pub fn load_pcm<P: AsRef<Path>>(path: P, sample_rate: u32) -> Result<Vec<i16>> {
    let reader = AudioFileReader::open(path)?;
    let file_name = reader.info.file_name.clone();
    let pcm = reader.decode_mono_resampled(sample_rate)?;
    info!(
        "Decoded {} into {} samples at {}Hz",
        file_name,
        pcm.len(),
        sample_rate
    );
    Ok(pcm)
}

fn resample(input: &[f64], source_rate: u32, target_rate: u32) -> Result<Vec<f64>> {
    if source_rate == target_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    let mut resampler = FftFixedIn::<f64>::new(
        source_rate as usize,
        target_rate as usize,
        RESAMPLE_CHUNK_SIZE,
        2,
        1,
    )?;

    let delay = resampler.output_delay();
    let expected_len =
        (input.len() as u64 * target_rate as u64).div_ceil(source_rate as u64) as usize;

    let mut output = Vec::with_capacity(expected_len + delay + RESAMPLE_CHUNK_SIZE);
    let mut pos = 0;
    // Keep feeding zero chunks past the end until the delayed tail has come out.
    while output.len() < expected_len + delay {
        let end = (pos + RESAMPLE_CHUNK_SIZE).min(input.len());
        let mut chunk = if pos < end {
            input[pos..end].to_vec()
        } else {
            Vec::new()
        };
        chunk.resize(RESAMPLE_CHUNK_SIZE, 0.0);

        let resampled = resampler.process(&[chunk], None)?;
        output.extend_from_slice(&resampled[0]);
        pos += RESAMPLE_CHUNK_SIZE;
    }

    Ok(output[delay..delay + expected_len].to_vec())
}
