//! Voice processing module
//!
//! Handles audio capture, wake word detection, the pre-roll buffer and
//! playback. Mode decisions live in [`crate::turn`].

mod capture;
mod format;
mod playback;
mod recording;
mod resample;
mod wake_word;

pub use capture::{AudioCapture, CaptureEvent, rms, sine_pcm};
pub use format::{AudioFormat, AudioFrame, bytes_to_samples, f32_to_i16, samples_to_bytes};
pub use playback::{
    CpalSpeaker, DRAIN_GRACE, DeviceSpeakerFactory, NullSpeaker, PlaybackClock, SpeakerFactory, SpeakerSink,
    play_blocking,
};
pub use recording::{PreRollBuffer, RecordingSession, write_wav};
pub use resample::PcmResampler;
pub use wake_word::{
    Cooldown, InferenceBackend, OnnxModel, PredictionWindow, WakeEvent, WakeWordDetector,
};
