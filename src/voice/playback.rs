//! Audio playback to speakers
//!
//! A speaker is opened per utterance and torn down afterwards. Completion is
//! reported natively when the backend can tell (cpal drains its queue), and
//! otherwise estimated from the bytes written and the playback rate.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use super::format::AudioFormat;
use crate::config::SpeakerBackend;
use crate::{Error, Result};

/// Longest wait past the estimate for a backend that never reports drained
pub const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Consumes PCM chunks for one utterance
pub trait SpeakerSink {
    /// Queue PCM bytes for playback
    ///
    /// # Errors
    ///
    /// Returns error if the device rejected the audio
    fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// No more audio will be written for this utterance
    fn signal_end(&mut self);

    /// Native completion signal, or `None` when the backend cannot report it
    ///
    /// Drained means the queue was handed to the device, which may still be
    /// playing it.
    fn is_drained(&self) -> Option<bool> {
        None
    }
}

/// Opens a fresh speaker for each utterance
pub trait SpeakerFactory {
    /// Open a speaker for the given format
    ///
    /// # Errors
    ///
    /// Returns error if the output device is unavailable
    fn open(&self, format: AudioFormat) -> Result<Box<dyn SpeakerSink>>;
}

/// Predicts when physical playback finishes from bytes written
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    format: AudioFormat,
    finish: Option<Instant>,
    bytes: usize,
}

impl PlaybackClock {
    /// Create a clock with nothing queued
    #[must_use]
    pub const fn new(format: AudioFormat) -> Self {
        Self {
            format,
            finish: None,
            bytes: 0,
        }
    }

    /// Account for a chunk written at `now`
    ///
    /// If the speaker already ran dry the new audio starts playing now.
    pub fn record(&mut self, bytes: usize, now: Instant) {
        let start = self.finish.map_or(now, |finish| finish.max(now));
        self.finish = Some(start + self.format.duration_of(bytes));
        self.bytes += bytes;
    }

    /// Predicted moment the speaker is empty
    #[must_use]
    pub const fn finish_time(&self) -> Option<Instant> {
        self.finish
    }

    /// Total bytes accounted for
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }
}

/// Shared state between the writer and the cpal callback
#[derive(Default)]
struct PlaybackQueue {
    samples: Mutex<VecDeque<i16>>,
    ended: AtomicBool,
    drained: AtomicBool,
}

/// Plays PCM on the default output device
pub struct CpalSpeaker {
    queue: Arc<PlaybackQueue>,
    odd_byte: Option<u8>,
    _stream: Stream,
}

impl CpalSpeaker {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn open(format: AudioFormat) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let rate = SampleRate(format.sample_rate);
        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| c.channels() == 1 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
            .or_else(|| {
                // Fallback: try stereo
                device.supported_output_configs().ok()?.find(|c| {
                    c.channels() == 2 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
                })
            })
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config: StreamConfig = supported_config.with_sample_rate(rate).config();
        let channels = config.channels as usize;

        let queue = Arc::new(PlaybackQueue::default());
        let callback_queue = Arc::clone(&queue);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let Ok(mut samples) = callback_queue.samples.lock() else {
                        data.fill(0.0);
                        return;
                    };

                    for frame in data.chunks_mut(channels) {
                        let sample = samples.pop_front().map_or(0.0, |s| f32::from(s) / 32768.0);
                        frame.fill(sample);
                    }

                    if samples.is_empty() && callback_queue.ended.load(Ordering::Acquire) {
                        callback_queue.drained.store(true, Ordering::Release);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = format.sample_rate,
            channels,
            "speaker opened"
        );

        Ok(Self {
            queue,
            odd_byte: None,
            _stream: stream,
        })
    }
}

impl SpeakerSink for CpalSpeaker {
    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let mut bytes = Vec::with_capacity(chunk.len() + 1);
        bytes.extend(self.odd_byte.take());
        bytes.extend_from_slice(chunk);
        if bytes.len() % 2 == 1 {
            self.odd_byte = bytes.pop();
        }

        let mut samples = self
            .queue
            .samples
            .lock()
            .map_err(|_| Error::Audio("playback queue poisoned".to_string()))?;
        samples.extend(super::format::bytes_to_samples(&bytes));

        // Audio after an end signal reopens the utterance
        self.queue.ended.store(false, Ordering::Release);
        self.queue.drained.store(false, Ordering::Release);
        Ok(())
    }

    fn signal_end(&mut self) {
        self.queue.ended.store(true, Ordering::Release);
    }

    fn is_drained(&self) -> Option<bool> {
        Some(self.queue.drained.load(Ordering::Acquire))
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        tracing::debug!("speaker closed");
    }
}

/// Discards audio; completion is always estimated
#[derive(Debug, Default)]
pub struct NullSpeaker {
    written: usize,
}

impl SpeakerSink for NullSpeaker {
    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.written += chunk.len();
        Ok(())
    }

    fn signal_end(&mut self) {
        tracing::trace!(bytes = self.written, "null speaker finished");
    }
}

/// Opens speakers on the backend chosen in configuration
#[derive(Debug, Clone, Copy)]
pub struct DeviceSpeakerFactory {
    backend: SpeakerBackend,
}

impl DeviceSpeakerFactory {
    /// Create a factory for the given backend
    #[must_use]
    pub const fn new(backend: SpeakerBackend) -> Self {
        Self { backend }
    }
}

impl SpeakerFactory for DeviceSpeakerFactory {
    fn open(&self, format: AudioFormat) -> Result<Box<dyn SpeakerSink>> {
        match self.backend {
            SpeakerBackend::Cpal => Ok(Box::new(CpalSpeaker::open(format)?)),
            SpeakerBackend::Null => Ok(Box::new(NullSpeaker::default())),
        }
    }
}

/// Play a finished buffer and wait until it is heard
///
/// Used by the diagnostics commands; the assistant streams instead.
///
/// # Errors
///
/// Returns error if the speaker cannot be opened or written
pub async fn play_blocking(factory: &dyn SpeakerFactory, format: AudioFormat, pcm: &[u8], margin: Duration) -> Result<()> {
    let mut speaker = factory.open(format)?;
    let mut clock = PlaybackClock::new(format);

    clock.record(pcm.len(), Instant::now());
    speaker.write(pcm)?;
    speaker.signal_end();

    let estimate = clock.finish_time().unwrap_or_else(Instant::now);
    loop {
        let now = Instant::now();
        let queued = speaker.is_drained() == Some(false);
        if (now >= estimate && !queued) || now >= estimate + DRAIN_GRACE {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(margin).await;

    tracing::debug!(bytes = pcm.len(), "playback complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_accumulates() {
        let format = AudioFormat::pcm16_mono(24000);
        let start = Instant::now();
        let mut clock = PlaybackClock::new(format);
        assert!(clock.finish_time().is_none());

        // Half a second per 24000 bytes
        clock.record(24000, start);
        clock.record(24000, start);
        assert_eq!(clock.finish_time(), Some(start + Duration::from_secs(1)));
        assert_eq!(clock.bytes(), 48000);
    }

    #[test]
    fn test_clock_restarts_after_underrun() {
        let format = AudioFormat::pcm16_mono(24000);
        let start = Instant::now();
        let mut clock = PlaybackClock::new(format);

        clock.record(24000, start);
        let late = start + Duration::from_secs(2);
        clock.record(24000, late);
        assert_eq!(clock.finish_time(), Some(late + Duration::from_millis(500)));
    }

    #[test]
    fn test_null_speaker_has_no_native_signal() {
        let mut speaker = NullSpeaker::default();
        speaker.write(&[0; 10]).unwrap();
        speaker.signal_end();
        assert_eq!(speaker.is_drained(), None);
    }

    #[tokio::test]
    async fn test_play_blocking_null_backend() {
        let factory = DeviceSpeakerFactory::new(SpeakerBackend::Null);
        let format = AudioFormat::pcm16_mono(16000);
        let started = Instant::now();

        // 0.1 s of audio plus no margin
        play_blocking(&factory, format, &[0; 3200], Duration::ZERO).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
