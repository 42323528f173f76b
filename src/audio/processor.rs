//! # Audio Format Analysis
//!
//! Decodes the raw PCM-family bytes carried in binary WebSocket frames and
//! computes the per-chunk silence verdict used by the segmenter.
//!
//! ## Supported Encodings:
//! - **µ-law (G.711 PCMU)**: one byte per sample, the AudioHook default
//! - **Linear16**: 16-bit signed little-endian samples
//!
//! The format is connection-wide configuration. Nothing here is negotiated
//! per frame.

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

/// Audio encodings accepted on the binary frame path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// G.711 µ-law, 8 bits per sample
    Mulaw,
    /// 16-bit signed PCM, little-endian
    Linear16,
}

impl AudioEncoding {
    /// Number of bytes a single sample of one channel occupies.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            AudioEncoding::Mulaw => 1,
            AudioEncoding::Linear16 => 2,
        }
    }

    /// Encoded byte value of one silent sample.
    ///
    /// µ-law has no zero code point at 0x00; 0xFF decodes to zero amplitude.
    pub fn silence_byte(&self) -> u8 {
        match self {
            AudioEncoding::Mulaw => 0xFF,
            AudioEncoding::Linear16 => 0x00,
        }
    }

    /// Name used in recognizer requests and API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::Mulaw => "MULAW",
            AudioEncoding::Linear16 => "LINEAR16",
        }
    }
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed audio format for every connection the gateway serves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u8,
}

impl AudioFormat {
    pub fn new(encoding: AudioEncoding, sample_rate: u32, channels: u8) -> Self {
        Self {
            encoding,
            sample_rate,
            channels,
        }
    }

    /// Bytes of encoded audio per second of wall-clock time.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * self.encoding.bytes_per_sample()
    }

    /// Byte count corresponding to `window_ms` milliseconds of audio.
    ///
    /// ## Example:
    /// 5000ms of 8kHz mono µ-law = 8000 * 1 * 1 * 5 = 40,000 bytes
    pub fn window_threshold_bytes(&self, window_ms: u32) -> usize {
        self.bytes_per_second() * window_ms as usize / 1000
    }
}

/// Decode one G.711 µ-law byte to a 16-bit linear sample.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    const BIAS: i32 = 0x84;

    let inverted = !byte;
    let sign = inverted & 0x80;
    let exponent = ((inverted >> 4) & 0x07) as i32;
    let mantissa = (inverted & 0x0F) as i32;

    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Decode a chunk into normalised samples in `[-1.0, 1.0]`.
///
/// A trailing odd byte of a linear16 chunk is not a full sample and is
/// ignored.
pub fn decode_samples(data: &[u8], encoding: AudioEncoding) -> Vec<f32> {
    match encoding {
        AudioEncoding::Mulaw => data
            .iter()
            .map(|&b| mulaw_to_linear(b) as f32 / 32768.0)
            .collect(),
        AudioEncoding::Linear16 => {
            let mut cursor = Cursor::new(data);
            let mut samples = Vec::with_capacity(data.len() / 2);
            while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
                samples.push(sample as f32 / 32768.0);
            }
            samples
        }
    }
}

/// Mean of the squared sample amplitudes (signal energy per sample).
pub fn mean_square(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    sum / samples.len() as f64
}

/// Silence verdict for a single chunk.
///
/// Empty chunks and chunks too short to hold one sample are silent.
pub fn is_silent(data: &[u8], encoding: AudioEncoding, threshold: f64) -> bool {
    mean_square(&decode_samples(data, encoding)) < threshold
}
