//! PCM audio format and frames

use std::time::Duration;

use crate::{Error, Result};

/// Layout of raw signed PCM audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Samples per second
    pub sample_rate: u32,
    /// Bits per sample
    pub bit_depth: u16,
    /// Interleaved channel count
    pub channels: u16,
}

impl AudioFormat {
    /// 16-bit mono at the given rate
    #[must_use]
    pub const fn pcm16_mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            bit_depth: 16,
            channels: 1,
        }
    }

    /// Bytes per sample frame (all channels)
    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        (self.bit_depth as usize / 8) * self.channels as usize
    }

    /// Bytes of audio per second of playback
    #[must_use]
    pub const fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_bytes()
    }

    /// Byte length of the given duration, rounded down to whole frames
    #[must_use]
    pub fn bytes_for(&self, duration: Duration) -> usize {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let frames = (duration.as_secs_f64() * f64::from(self.sample_rate)) as usize;
        frames * self.frame_bytes()
    }

    /// Playback duration of the given number of bytes
    #[must_use]
    pub fn duration_of(&self, bytes: usize) -> Duration {
        #[allow(clippy::cast_precision_loss)]
        let secs = bytes as f64 / self.bytes_per_second() as f64;
        Duration::from_secs_f64(secs)
    }
}

/// Immutable buffer of raw signed PCM samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    bytes: Vec<u8>,
    format: AudioFormat,
}

impl AudioFrame {
    /// Wrap captured bytes
    ///
    /// # Errors
    ///
    /// Returns error if the length is not a whole number of sample frames
    pub fn new(bytes: Vec<u8>, format: AudioFormat) -> Result<Self> {
        if bytes.len() % format.frame_bytes() != 0 {
            return Err(Error::Audio(format!(
                "frame of {} bytes is not aligned to {}-byte samples",
                bytes.len(),
                format.frame_bytes()
            )));
        }
        Ok(Self { bytes, format })
    }

    /// Build a 16-bit frame from samples
    #[must_use]
    pub fn from_samples(samples: &[i16], format: AudioFormat) -> Self {
        Self {
            bytes: samples_to_bytes(samples),
            format,
        }
    }

    /// Raw little-endian bytes
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length in sample frames
    #[must_use]
    pub fn len_samples(&self) -> usize {
        self.bytes.len() / self.format.frame_bytes()
    }

    /// Whether the frame holds no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Consume into the raw bytes
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Encode i16 samples as little-endian bytes
#[must_use]
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decode little-endian bytes into i16 samples; a trailing odd byte is ignored
#[must_use]
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Convert f32 [-1.0, 1.0] to i16
#[must_use]
pub fn f32_to_i16(sample: f32) -> i16 {
    #[allow(clippy::cast_possible_truncation)]
    let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sizes() {
        let format = AudioFormat::pcm16_mono(24000);
        assert_eq!(format.frame_bytes(), 2);
        assert_eq!(format.bytes_per_second(), 48000);
        assert_eq!(format.bytes_for(Duration::from_secs(1)), 48000);
        assert_eq!(format.duration_of(24000), Duration::from_millis(500));
    }

    #[test]
    fn test_frame_alignment() {
        let format = AudioFormat::pcm16_mono(16000);
        assert!(AudioFrame::new(vec![0; 4], format).is_ok());
        assert!(matches!(AudioFrame::new(vec![0; 3], format), Err(Error::Audio(_))));

        let frame = AudioFrame::new(vec![0; 192], format).unwrap();
        assert_eq!(frame.len_samples(), 96);
    }

    #[test]
    fn test_sample_conversion() {
        let samples = [0i16, 1, -1, i16::MAX, i16::MIN];
        assert_eq!(bytes_to_samples(&samples_to_bytes(&samples)), samples);
        assert_eq!(f32_to_i16(1.5), i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
    }
}
