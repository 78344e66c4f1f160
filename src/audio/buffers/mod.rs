//! Audio buffer implementations.
//!
//! - [`JitterBuffer`] - Bounded drop-oldest FIFO between frame reception and playback

pub mod jitter_buffer;

pub use jitter_buffer::{BufferStats, JitterBuffer};
