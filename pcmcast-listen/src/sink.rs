//! Output sinks for received PCM
//!
//! The relay payload is interleaved signed 16-bit little-endian stereo at
//! 44.1kHz; [`WavSink`] writes it to a WAV file with that layout.

use crate::error::Result;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Relay stream layout
pub const SAMPLE_RATE: u32 = 44100;
pub const CHANNELS: u16 = 2;
pub const BITS_PER_SAMPLE: u16 = 16;

/// Destination for released PCM bytes
pub trait AudioSink {
    /// Append raw little-endian PCM
    fn write_pcm(&mut self, pcm: &[u8]) -> Result<()>;

    /// Total bytes accepted so far
    fn bytes_written(&self) -> u64;
}

/// In-memory sink, mostly useful in tests
impl AudioSink for Vec<u8> {
    fn write_pcm(&mut self, pcm: &[u8]) -> Result<()> {
        self.extend_from_slice(pcm);
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.len() as u64
    }
}

/// 16-bit stereo 44.1kHz WAV file
pub struct WavSink {
    writer: WavWriter<BufWriter<File>>,
    /// Low byte of a sample split across two writes
    carry: Option<u8>,
    bytes: u64,
}

impl WavSink {
    pub fn create(path: &Path) -> Result<Self> {
        let spec = WavSpec {
            channels: CHANNELS,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: BITS_PER_SAMPLE,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec)?;

        Ok(Self {
            writer,
            carry: None,
            bytes: 0,
        })
    }

    /// Write the header lengths and close the file
    pub fn finalize(self) -> Result<()> {
        self.writer.finalize()?;
        Ok(())
    }
}

impl AudioSink for WavSink {
    fn write_pcm(&mut self, pcm: &[u8]) -> Result<()> {
        self.bytes += pcm.len() as u64;

        let mut rest = pcm;
        if let Some(low) = self.carry.take() {
            match rest.split_first() {
                Some((&high, tail)) => {
                    self.writer.write_sample(i16::from_le_bytes([low, high]))?;
                    rest = tail;
                }
                None => {
                    self.carry = Some(low);
                    return Ok(());
                }
            }
        }

        let mut samples = rest.chunks_exact(2);
        for pair in &mut samples {
            self.writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        self.carry = samples.remainder().first().copied();

        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }
}
