//! Audio data types, codec, buffering and playback.
//!
//! # Data Types
//! - [`frame::AudioFormat`] - Sample rate / channel / frame duration of the stream
//! - [`frame::AudioFrame`] - A fixed-length block of mono 16-bit PCM
//!
//! # Sources
//! - [`file`] - Audio file decoding with symphonia, resampled with rubato
//! - [`frame_source`] - Cuts canonical PCM into zero-padded frames
//!
//! # Codec
//! - [`opus`] - Opus encoder/decoder behind the [`opus::FrameEncoder`]/[`opus::FrameDecoder`] seam
//!
//! # Buffers
//! - [`buffers::JitterBuffer`] - Bounded drop-oldest FIFO
//!
//! # Playback
//! - [`playback::PlaybackLoop`] - Moves frames from the jitter buffer to an output sink

pub mod buffers;
pub mod file;
pub mod frame;
pub mod frame_source;
pub mod opus;
pub mod playback;

pub use frame::AudioFormat;
pub use frame_source::FrameSource;
pub use opus::OpusDecoder;
