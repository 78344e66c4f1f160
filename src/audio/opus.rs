//! Opus codec adapter.
//!
//! Maps one fixed-length [`AudioFrame`] to exactly one compressed payload and
//! back. The encoder is configured for mono music-grade audio
//! (`Application::Audio`) at the stream's sample rate.

use opus::{Application, Channels, Decoder, Encoder};

use super::frame::{AudioFormat, AudioFrame};
use crate::error::CodecError;

const MAX_OPUS_PACKET_SIZE: usize = 4000;
// 120ms at 48kHz, the largest frame Opus can emit.
const MAX_FRAME_SIZE: usize = 5760;

/// Turns PCM frames into compressed payloads.
pub trait FrameEncoder: Send {
    fn encode(&mut self, frame: &AudioFrame) -> Result<Vec<u8>, CodecError>;
}

/// Turns compressed payloads back into PCM frames.
pub trait FrameDecoder: Send {
    fn decode(&mut self, payload: &[u8]) -> Result<AudioFrame, CodecError>;
}

pub struct OpusEncoder {
    encoder: Encoder,
    frame_len: usize,
    output_buffer: Vec<u8>,
}

impl OpusEncoder {
    pub fn new(format: &AudioFormat) -> Result<Self, CodecError> {
        let encoder = Encoder::new(format.sample_rate, Channels::Mono, Application::Audio)
            .map_err(|source| CodecError::Create {
                role: "encoder",
                source,
            })?;

        Ok(Self {
            encoder,
            frame_len: format.samples_per_frame(),
            output_buffer: vec![0u8; MAX_OPUS_PACKET_SIZE],
        })
    }
}

impl FrameEncoder for OpusEncoder {
    fn encode(&mut self, frame: &AudioFrame) -> Result<Vec<u8>, CodecError> {
        if frame.samples().len() != self.frame_len {
            return Err(CodecError::FrameLength {
                expected: self.frame_len,
                actual: frame.samples().len(),
            });
        }

        let len = self
            .encoder
            .encode(frame.samples(), &mut self.output_buffer)
            .map_err(CodecError::Encode)?;

        Ok(self.output_buffer[..len].to_vec())
    }
}

pub struct OpusDecoder {
    decoder: Decoder,
    frame_len: usize,
    output_buffer: Vec<i16>,
}

impl OpusDecoder {
    pub fn new(format: &AudioFormat) -> Result<Self, CodecError> {
        let decoder = Decoder::new(format.sample_rate, Channels::Mono).map_err(|source| {
            CodecError::Create {
                role: "decoder",
                source,
            }
        })?;

        Ok(Self {
            decoder,
            frame_len: format.samples_per_frame(),
            output_buffer: vec![0i16; MAX_FRAME_SIZE],
        })
    }
}

impl FrameDecoder for OpusDecoder {
    fn decode(&mut self, payload: &[u8]) -> Result<AudioFrame, CodecError> {
        let samples = self
            .decoder
            .decode(payload, &mut self.output_buffer, false)
            .map_err(CodecError::Decode)?;

        if samples != self.frame_len {
            return Err(CodecError::FrameLength {
                expected: self.frame_len,
                actual: samples,
            });
        }

        Ok(AudioFrame::padded(
            &self.output_buffer[..samples],
            self.frame_len,
        ))
    }
}
