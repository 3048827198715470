//! Streaming resampler feeding the wake word detector
//!
//! The network path may run at 24 kHz while the detector expects 16 kHz.
//! Input arrives in arbitrary byte chunks, so samples are buffered until a
//! full resampler block is available.

use rubato::{FftFixedIn, Resampler};

use super::format::{bytes_to_samples, samples_to_bytes};
use crate::{Error, Result};

/// Input block size for the FFT resampler
const BLOCK_SIZE: usize = 480;

/// Converts 16-bit mono PCM between sample rates
pub struct PcmResampler {
    resampler: FftFixedIn<f32>,
    pending: Vec<f32>,
    odd_byte: Option<u8>,
}

impl PcmResampler {
    /// Create a resampler between two rates
    ///
    /// # Errors
    ///
    /// Returns error if the rates are unsupported
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let resampler = FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, BLOCK_SIZE, 2, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

        tracing::debug!(from_rate, to_rate, "detector resampler initialized");

        Ok(Self {
            resampler,
            pending: Vec::with_capacity(BLOCK_SIZE * 2),
            odd_byte: None,
        })
    }

    /// Push raw bytes and return whatever output is complete
    ///
    /// # Errors
    ///
    /// Returns error if resampling fails
    pub fn process(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut joined;
        let input = if let Some(first) = self.odd_byte.take() {
            joined = Vec::with_capacity(bytes.len() + 1);
            joined.push(first);
            joined.extend_from_slice(bytes);
            joined.as_slice()
        } else {
            bytes
        };

        if input.len() % 2 == 1 {
            self.odd_byte = input.last().copied();
        }

        self.pending
            .extend(bytes_to_samples(input).into_iter().map(|s| f32::from(s) / 32768.0));

        let mut output = Vec::new();
        let mut consumed = 0;
        while self.pending.len() - consumed >= self.resampler.input_frames_next() {
            let needed = self.resampler.input_frames_next();
            let block = &self.pending[consumed..consumed + needed];
            let result = self
                .resampler
                .process(&[block], None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            consumed += needed;
            output.extend(result[0].iter().map(|&s| super::format::f32_to_i16(s)));
        }
        self.pending.drain(..consumed);

        Ok(samples_to_bytes(&output))
    }

    /// Drop buffered input and the filter history
    pub fn reset(&mut self) {
        self.resampler.reset();
        self.pending.clear();
        self.odd_byte = None;
    }

    /// Input samples waiting for a full block
    #[must_use]
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_ratio() {
        let mut resampler = PcmResampler::new(24000, 16000).unwrap();

        // One second of input in uneven pieces
        let input = vec![0u8; 48000];
        let mut out = 0;
        for piece in input.chunks(1001) {
            out += resampler.process(piece).unwrap().len();
        }

        // 24000 samples is 50 blocks of 480 in, 320 out each
        assert_eq!(out, 50 * 320 * 2);
    }

    #[test]
    fn test_reset_discards_partial_block() {
        let mut resampler = PcmResampler::new(24000, 16000).unwrap();
        assert!(resampler.process(&[0u8; 101]).unwrap().is_empty());
        assert_eq!(resampler.pending_samples(), 50);

        resampler.reset();
        assert_eq!(resampler.pending_samples(), 0);

        assert_eq!(resampler.process(&[0u8; 960]).unwrap().len(), 640);
        assert_eq!(resampler.pending_samples(), 0);
    }

    #[test]
    fn test_buffers_until_block() {
        let mut resampler = PcmResampler::new(24000, 16000).unwrap();
        assert!(resampler.process(&[0u8; 100]).unwrap().is_empty());
    }
}
