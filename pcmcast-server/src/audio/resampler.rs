//! Audio resampling using rubato
//!
//! Converts decoded audio to the relay's fixed 44.1kHz sample rate.

use crate::error::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

/// Output sample rate of every relayed stream
pub const TARGET_SAMPLE_RATE: u32 = 44100;

/// Frames fed to the resampler per call
const CHUNK_FRAMES: usize = 4096;

/// Resample interleaved audio from `input_rate` to [`TARGET_SAMPLE_RATE`].
///
/// Input already at the target rate is returned as a copy. The output is
/// trimmed of the resampler's delay so it starts aligned with the input.
pub fn resample_to_target(input: &[f32], input_rate: u32, channels: u16) -> Result<Vec<f32>> {
    if input_rate == TARGET_SAMPLE_RATE {
        debug!("Sample rate already at {}Hz, skipping resample", TARGET_SAMPLE_RATE);
        return Ok(input.to_vec());
    }
    if input_rate == 0 || channels == 0 {
        return Err(Error::Decode(format!(
            "Cannot resample {} channel(s) at {}Hz",
            channels, input_rate
        )));
    }

    let channels = channels as usize;
    let planar = split_channels(input, channels);
    let input_frames = planar[0].len();
    let ratio = TARGET_SAMPLE_RATE as f64 / input_rate as f64;
    let expected_frames = (input_frames as f64 * ratio).ceil() as usize;

    debug!(
        "Resampling {} frames from {}Hz to {}Hz",
        input_frames, input_rate, TARGET_SAMPLE_RATE
    );

    let mut resampler = FastFixedIn::<f32>::new(
        ratio,
        1.0,
        PolynomialDegree::Septic,
        CHUNK_FRAMES,
        channels,
    )
    .map_err(|e| Error::Decode(format!("Failed to create resampler: {}", e)))?;

    let delay = resampler.output_delay();
    let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected_frames + delay); channels];

    let mut pos = 0;
    while input_frames - pos >= resampler.input_frames_next() {
        let take = resampler.input_frames_next();
        let chunk: Vec<&[f32]> = planar.iter().map(|ch| &ch[pos..pos + take]).collect();
        let processed = resampler
            .process(&chunk, None)
            .map_err(|e| Error::Decode(format!("Resampling failed: {}", e)))?;
        append_planar(&mut output, processed);
        pos += take;
    }

    if pos < input_frames {
        let tail: Vec<&[f32]> = planar.iter().map(|ch| &ch[pos..]).collect();
        let processed = resampler
            .process_partial(Some(tail.as_slice()), None)
            .map_err(|e| Error::Decode(format!("Resampling failed: {}", e)))?;
        append_planar(&mut output, processed);
    }

    // Drain the samples still held back by the resampler delay
    while output[0].len() < expected_frames + delay {
        let processed = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .map_err(|e| Error::Decode(format!("Resampling failed: {}", e)))?;
        if processed[0].is_empty() {
            break;
        }
        append_planar(&mut output, processed);
    }

    let interleaved = join_channels(&output, delay, expected_frames);

    debug!(
        "Resampled {} input frames to {} output frames",
        input_frames,
        interleaved.len() / channels
    );

    Ok(interleaved)
}

fn append_planar(output: &mut [Vec<f32>], processed: Vec<Vec<f32>>) {
    for (out, chunk) in output.iter_mut().zip(processed) {
        out.extend(chunk);
    }
}

/// [L, R, L, R, ...] -> [[L, L, ...], [R, R, ...]]
fn split_channels(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = samples.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];

    for frame in samples.chunks_exact(channels) {
        for (ch, &sample) in frame.iter().enumerate() {
            planar[ch].push(sample);
        }
    }

    planar
}

/// Interleave `frames` frames of planar audio starting at frame `skip`.
fn join_channels(planar: &[Vec<f32>], skip: usize, frames: usize) -> Vec<f32> {
    let available = planar
        .iter()
        .map(|ch| ch.len().saturating_sub(skip))
        .min()
        .unwrap_or(0);
    let frames = frames.min(available);

    let mut interleaved = Vec::with_capacity(frames * planar.len());
    for frame in skip..skip + frames {
        for ch in planar {
            interleaved.push(ch[frame]);
        }
    }

    interleaved
}
