//! Listening session state and the pre-roll buffer
//!
//! While sleeping, captured audio goes into a capped pre-roll buffer so the
//! first words of a request survive detection latency. On wake the whole
//! buffer is flushed as the first network append.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::format::AudioFormat;
use crate::Result;
use crate::realtime::ClientEvent;

/// Capacity-bounded ring of the most recent raw audio bytes
#[derive(Debug, Clone)]
pub struct PreRollBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl PreRollBuffer {
    /// Create a buffer holding at most `capacity` bytes
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Create a buffer holding `seconds` of audio in the given format
    #[must_use]
    pub fn for_duration(format: AudioFormat, seconds: f32) -> Self {
        Self::new(format.bytes_for(std::time::Duration::from_secs_f32(seconds)))
    }

    /// Append bytes, discarding the oldest beyond capacity
    pub fn append(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.capacity {
            self.bytes.clear();
            self.bytes.extend(&chunk[chunk.len() - self.capacity..]);
            return;
        }

        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.capacity);
        self.bytes.drain(..overflow);
        self.bytes.extend(chunk);
    }

    /// Take the entire contents, leaving the buffer empty
    pub fn take(&mut self) -> Vec<u8> {
        self.bytes.drain(..).collect()
    }

    /// Bytes currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Maximum bytes held
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard everything
    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// State of the current listening session
#[derive(Debug)]
pub struct RecordingSession {
    format: AudioFormat,
    start_time: Instant,
    has_spoken: bool,
    chunks: Vec<Vec<u8>>,
    pre_roll: PreRollBuffer,
}

impl RecordingSession {
    /// Create the session record for the process lifetime
    #[must_use]
    pub fn new(format: AudioFormat, preroll_seconds: f32, now: Instant) -> Self {
        Self {
            format,
            start_time: now,
            has_spoken: false,
            chunks: Vec::new(),
            pre_roll: PreRollBuffer::for_duration(format, preroll_seconds),
        }
    }

    /// Start a fresh listening session
    pub fn reset(&mut self, now: Instant) {
        self.chunks.clear();
        self.has_spoken = false;
        self.start_time = now;
    }

    /// Record a chunk captured during `listen` and build its network append
    pub fn append_incoming(&mut self, chunk: &[u8]) -> ClientEvent {
        self.chunks.push(chunk.to_vec());
        ClientEvent::audio_append(chunk)
    }

    /// Keep a chunk captured while sleeping
    pub fn buffer_pre_roll(&mut self, chunk: &[u8]) {
        self.pre_roll.append(chunk);
    }

    /// Take the pre-roll contents and record them as the first chunk of the session
    pub fn flush_pre_roll(&mut self) -> Vec<u8> {
        let audio = self.pre_roll.take();
        if !audio.is_empty() {
            self.chunks.push(audio.clone());
        }
        audio
    }

    /// Note that the remote side heard speech; idempotent
    pub fn mark_spoken(&mut self) {
        if !self.has_spoken {
            tracing::debug!("speech started");
        }
        self.has_spoken = true;
    }

    /// Whether speech was detected in this session
    #[must_use]
    pub const fn has_spoken(&self) -> bool {
        self.has_spoken
    }

    /// When the session started
    #[must_use]
    pub const fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Chunks recorded in this session
    #[must_use]
    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    /// Pre-roll buffer
    #[must_use]
    pub const fn pre_roll(&self) -> &PreRollBuffer {
        &self.pre_roll
    }

    /// Write the recorded chunks to a timestamped WAV file in `dir`
    ///
    /// # Errors
    ///
    /// Returns error if the directory or file cannot be written
    pub fn save_recording(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let name = format!("request_audio_{}.wav", chrono::Local::now().format("%Y%m%d_%H%M%S%.3f"));
        let path = dir.join(name);

        let file = std::io::BufWriter::new(std::fs::File::create(&path)?);
        write_wav(file, self.format, self.chunks.iter().map(Vec::as_slice))?;

        tracing::debug!(path = %path.display(), chunks = self.chunks.len(), "saved recording");
        Ok(path)
    }
}

/// Write raw 16-bit chunks as an uncompressed PCM WAV stream
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn write_wav<'a, W, I>(writer: W, format: AudioFormat, chunks: I) -> Result<()>
where
    W: std::io::Write + std::io::Seek,
    I: IntoIterator<Item = &'a [u8]>,
{
    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: format.bit_depth,
        sample_format: hound::SampleFormat::Int,
    };

    let mut wav = hound::WavWriter::new(writer, spec)?;
    for chunk in chunks {
        for sample in super::format::bytes_to_samples(chunk) {
            wav.write_sample(sample)?;
        }
    }
    wav.finalize()?;

    Ok(())
}
