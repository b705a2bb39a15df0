//! Immutable PCM payload relayed to clients
//!
//! The whole source file is decoded once at startup into a [`PcmBuffer`]:
//! interleaved signed 16-bit little-endian samples, 44.1kHz, stereo. The
//! buffer is never mutated afterwards, so every broadcast run shares it
//! through an `Arc` without locking.

use super::decoder::{self, OUTPUT_CHANNELS};
use super::resampler::{self, TARGET_SAMPLE_RATE};
use crate::error::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Sample layout of the relayed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per sample
    pub sample_width: u16,
}

impl PcmFormat {
    /// 44.1kHz, 16-bit, stereo
    pub const RELAY: PcmFormat = PcmFormat {
        sample_rate: TARGET_SAMPLE_RATE,
        channels: OUTPUT_CHANNELS,
        sample_width: 2,
    };

    /// Bytes per interleaved frame
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.sample_width as usize
    }

    /// Bytes per second of audio
    pub fn byte_rate(&self) -> usize {
        self.sample_rate as usize * self.frame_size()
    }
}

/// Read-only audio payload, cheap to clone
#[derive(Debug, Clone)]
pub struct PcmBuffer {
    data: Arc<[u8]>,
    format: PcmFormat,
}

impl PcmBuffer {
    /// Wrap raw bytes that are already in `format`
    pub fn from_bytes(data: impl Into<Arc<[u8]>>, format: PcmFormat) -> Self {
        Self {
            data: data.into(),
            format,
        }
    }

    /// Decode, resample and quantize an audio file.
    ///
    /// This is CPU-bound; call it from `spawn_blocking` inside a runtime.
    ///
    /// # Errors
    /// - [`Error::Decode`] if the file is missing, unreadable, undecodable,
    ///   or decodes to no audio
    pub fn load(path: &Path) -> Result<Self> {
        let decoded = decoder::decode_file(path)?;
        if decoded.samples.is_empty() {
            return Err(Error::Decode(format!(
                "{} contains no audio samples",
                path.display()
            )));
        }

        let samples =
            resampler::resample_to_target(&decoded.samples, decoded.sample_rate, OUTPUT_CHANNELS)?;
        let buffer = Self::from_bytes(quantize_i16_le(&samples), PcmFormat::RELAY);

        info!(
            "Audio loaded: {} ({} bytes, {:.1}s)",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            buffer.len(),
            buffer.duration_seconds()
        );

        Ok(buffer)
    }

    /// Total payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    /// Playback duration at the buffer's format
    pub fn duration_seconds(&self) -> f64 {
        match self.format.byte_rate() {
            0 => 0.0,
            rate => self.data.len() as f64 / rate as f64,
        }
    }
}

/// Convert f32 samples in [-1.0, 1.0] to signed 16-bit little-endian bytes.
/// Out-of-range samples are clamped.
pub fn quantize_i16_le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32);
        bytes.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    bytes
}
