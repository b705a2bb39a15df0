//! Audio loading: decode, resample, quantize
//!
//! Produces the single [`PcmBuffer`] a relay session streams from.

pub mod decoder;
pub mod pcm;
pub mod resampler;

pub use pcm::{PcmBuffer, PcmFormat};
