//! Audio decoder using symphonia
//!
//! Decodes a whole audio file (MP3, FLAC, AAC, Vorbis, WAV) into interleaved
//! stereo f32 samples at the file's native sample rate.

use crate::error::{Error, Result};
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Output channel count of the decoder
pub const OUTPUT_CHANNELS: u16 = 2;

/// Decoded audio before resampling
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Interleaved stereo samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Native sample rate of the source
    pub sample_rate: u32,
    /// Channel count of the source (samples are always stereo)
    pub source_channels: u16,
}

impl DecodedAudio {
    /// Number of stereo frames
    pub fn frames(&self) -> usize {
        self.samples.len() / OUTPUT_CHANNELS as usize
    }
}

/// Decode an entire file.
///
/// # Errors
/// - [`Error::Decode`] if the file cannot be opened or probed, has no audio
///   track, or its decoder cannot be created
pub fn decode_file(path: &Path) -> Result<DecodedAudio> {
    debug!("Decoding entire file: {}", path.display());

    let file = std::fs::File::open(path)
        .map_err(|e| Error::Decode(format!("Failed to open file {}: {}", path.display(), e)))?;

    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| Error::Decode(format!("Failed to probe format: {}", e)))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| Error::Decode("No audio track found".to_string()))?;

    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| Error::Decode("Sample rate not found".to_string()))?;
    let source_channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .ok_or_else(|| Error::Decode("Channel count not found".to_string()))?;

    debug!(sample_rate, source_channels, "Audio track selected");

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| Error::Decode(format!("Failed to create decoder: {}", e)))?;

    let mut samples = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                debug!("Reached end of file");
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                warn!("Stream reset required, stopping decode");
                break;
            }
            Err(e) => {
                warn!("Error reading packet: {}", e);
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                // Corrupt frame, skip it
                warn!("Decode error: {}", e);
                continue;
            }
            Err(e) => {
                warn!("Decoder failed: {}", e);
                break;
            }
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        let required = decoded.capacity() * channels;

        let too_small = sample_buf
            .as_ref()
            .map_or(true, |buf| buf.capacity() < required);
        if too_small {
            sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }

        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            append_as_stereo(buf.samples(), channels, &mut samples);
        }
    }

    let audio = DecodedAudio {
        samples,
        sample_rate,
        source_channels,
    };

    debug!("Decoded {} frames", audio.frames());

    Ok(audio)
}

/// Append interleaved samples with `channels` channels as interleaved stereo.
///
/// Mono is duplicated to both sides; for more than two channels only the
/// first two (front left/right) are kept.
fn append_as_stereo(interleaved: &[f32], channels: usize, output: &mut Vec<f32>) {
    match channels {
        0 => {}
        1 => {
            output.reserve(interleaved.len() * 2);
            for &sample in interleaved {
                output.push(sample);
                output.push(sample);
            }
        }
        2 => output.extend_from_slice(interleaved),
        n => {
            output.reserve(interleaved.len() / n * 2);
            for frame in interleaved.chunks_exact(n) {
                output.push(frame[0]);
                output.push(frame[1]);
            }
        }
    }
}
