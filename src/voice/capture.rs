//! Audio capture from microphone
//!
//! The cpal callback converts samples to 16-bit little-endian bytes and
//! pushes them onto a channel; the receiver sees an unbounded stream of
//! chunks whose boundaries carry no meaning.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::format::{AudioFormat, AudioFrame, f32_to_i16, samples_to_bytes};
use crate::{Error, Result};

/// Output of the capture callback
#[derive(Debug)]
pub enum CaptureEvent {
    /// Captured audio
    Audio(AudioFrame),
    /// The device failed; capture cannot continue
    Failed(String),
}

/// Captures audio from the default input device
pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    format: AudioFormat,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the default input device at the format's sample rate
    ///
    /// Mono is preferred; multi-channel devices are reduced to their first channel.
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new(format: AudioFormat) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let rate = SampleRate(format.sample_rate);
        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
        };

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| c.channels() == 1 && supports_rate(c))
            .or_else(|| device.supported_input_configs().ok()?.find(|c| supports_rate(c)))
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        let config = supported_config.with_sample_rate(rate).config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = format.sample_rate,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            format,
            stream: None,
        })
    }

    /// Start capturing into the given channel
    ///
    /// # Errors
    ///
    /// Returns error if capture fails
    pub fn start(&mut self, tx: mpsc::UnboundedSender<CaptureEvent>) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let channels = self.config.channels as usize;
        let format = self.format;
        let error_tx = tx.clone();

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono: Vec<i16> = data
                        .chunks(channels)
                        .filter_map(|frame| frame.first().copied())
                        .map(f32_to_i16)
                        .collect();
                    if mono.is_empty() {
                        return;
                    }
                    let frame = AudioFrame::from_samples(&mono, format);
                    // Receiver gone means the assistant is shutting down
                    let _ = tx.send(CaptureEvent::Audio(frame));
                },
                move |err| {
                    tracing::error!(error = %err, "audio capture error");
                    let _ = error_tx.send(CaptureEvent::Failed(err.to_string()));
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Calculate RMS energy of 16-bit PCM bytes, normalized to [0, 1]
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms(bytes: &[u8]) -> f32 {
    let samples = super::format::bytes_to_samples(bytes);
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let v = f32::from(s) / 32768.0;
            v * v
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Encode a test tone as 16-bit PCM
#[must_use]
pub fn sine_pcm(format: AudioFormat, frequency: f32, seconds: f32, amplitude: f32) -> Vec<u8> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let count = (format.sample_rate as f32 * seconds) as usize;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<i16> = (0..count)
        .map(|i| {
            let t = i as f32 / format.sample_rate as f32;
            f32_to_i16(amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin())
        })
        .collect();

    samples_to_bytes(&samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms() {
        assert!(rms(&[]) < f32::EPSILON);
        assert!(rms(&[0u8; 200]) < 0.001);

        let tone = sine_pcm(AudioFormat::pcm16_mono(16000), 440.0, 0.1, 0.5);
        let energy = rms(&tone);
        assert!(energy > 0.3 && energy < 0.4, "rms {energy}");
    }

    #[test]
    fn test_sine_length() {
        let tone = sine_pcm(AudioFormat::pcm16_mono(24000), 440.0, 0.5, 0.3);
        assert_eq!(tone.len(), 24000);
    }
}
