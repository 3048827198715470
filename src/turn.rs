//! Turn-taking state machine
//!
//! The controller owns the assistant mode and decides where every captured
//! chunk goes:
//!
//! ```text
//!            wake word                 response.created
//!   Sleep ─────────────────► Listen ─────────────────────► Respond
//!     ▲                        │  ▲                            │
//!     │   inactivity timeout   │  │   response done + drained  │
//!     └────────────────────────┘  └────────────────────────────┘
//! ```
//!
//! Audio reaches the network only in `Listen`, the wake word detector only
//! runs in `Sleep`, and the speaker is only fed in `Respond`. Any channel or
//! device failure collapses to `Sleep`.
//!
//! All methods take the current time so the runtime can drive the machine
//! from its event loop and tests can drive it with synthetic clocks.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::config::{Config, WAKE_SAMPLE_RATE};
use crate::realtime::{ClientEvent, RealtimeSink, ServerEvent, ToolRequest};
use crate::voice::{
    AudioFormat, AudioFrame, DRAIN_GRACE, PcmResampler, PlaybackClock, RecordingSession,
    SpeakerFactory, SpeakerSink, WakeWordDetector,
};
use crate::{Error, Result};

/// Who holds the floor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Waiting for the wake word
    Sleep,
    /// Streaming the microphone to the remote API
    Listen,
    /// Playing the assistant's response
    Respond,
}

/// Timing and persistence settings for the controller
#[derive(Debug, Clone)]
pub struct TurnSettings {
    /// Listen this long without speech before sleeping
    pub sleep_timeout: Duration,
    /// Respond this long without server activity before sleeping
    pub response_timeout: Duration,
    /// Added to the playback estimate before reopening the microphone
    pub playback_margin: Duration,
    /// Seconds of audio kept while sleeping
    pub preroll_seconds: f32,
    /// Save each request to a WAV file when a response starts
    pub save_recordings: bool,
    /// Directory for saved requests
    pub recording_dir: PathBuf,
}

impl TurnSettings {
    /// Extract controller settings from the configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            sleep_timeout: config.turn.sleep_timeout,
            response_timeout: config.turn.response_timeout,
            playback_margin: config.audio.playback_margin,
            preroll_seconds: config.audio.preroll_seconds,
            save_recordings: config.debug,
            recording_dir: config.recording_dir.clone(),
        }
    }
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            sleep_timeout: Duration::from_millis(3500),
            response_timeout: Duration::from_secs(60),
            playback_margin: Duration::from_millis(500),
            preroll_seconds: 1.0,
            save_recordings: false,
            recording_dir: PathBuf::from("recordings"),
        }
    }
}

/// Playback state of the response being spoken
struct Utterance {
    speaker: Box<dyn SpeakerSink>,
    clock: PlaybackClock,
    done_at: Option<Instant>,
    drained_at: Option<Instant>,
    awaiting_tool: bool,
}

impl Utterance {
    fn new(speaker: Box<dyn SpeakerSink>, format: AudioFormat) -> Self {
        Self {
            speaker,
            clock: PlaybackClock::new(format),
            done_at: None,
            drained_at: None,
            awaiting_tool: false,
        }
    }

    /// Whether playback can be considered finished at `now`
    ///
    /// The margin always applies after the later of the byte-rate estimate
    /// and the backend's drain signal.
    fn is_finished(&mut self, now: Instant, margin: Duration) -> bool {
        let Some(done_at) = self.done_at else {
            return false;
        };
        if self.awaiting_tool {
            return false;
        }

        let estimate = self.clock.finish_time().map_or(done_at, |f| f.max(done_at));
        let silent_from = match self.speaker.is_drained() {
            None => estimate,
            Some(true) => estimate.max(*self.drained_at.get_or_insert(now)),
            Some(false) if now < estimate + DRAIN_GRACE => return false,
            Some(false) => estimate + DRAIN_GRACE,
        };
        now >= silent_from + margin
    }
}

/// Coordinates capture, wake detection, the realtime channel and playback
pub struct TurnController<C, F> {
    mode: Mode,
    settings: TurnSettings,
    format: AudioFormat,
    recording: RecordingSession,
    detector: WakeWordDetector,
    detector_resampler: Option<PcmResampler>,
    channel: C,
    speakers: F,
    utterance: Option<Utterance>,
    last_server_activity: Instant,
}

impl<C: RealtimeSink, F: SpeakerFactory> TurnController<C, F> {
    /// Create a controller in `Sleep`
    ///
    /// # Errors
    ///
    /// Returns error if the detector resampler cannot be built for the format
    pub fn new(
        settings: TurnSettings,
        format: AudioFormat,
        detector: WakeWordDetector,
        channel: C,
        speakers: F,
        now: Instant,
    ) -> Result<Self> {
        let detector_resampler = if format.sample_rate == WAKE_SAMPLE_RATE {
            None
        } else {
            Some(PcmResampler::new(format.sample_rate, WAKE_SAMPLE_RATE)?)
        };

        Ok(Self {
            mode: Mode::Sleep,
            recording: RecordingSession::new(format, settings.preroll_seconds, now),
            settings,
            format,
            detector,
            detector_resampler,
            channel,
            speakers,
            utterance: None,
            last_server_activity: now,
        })
    }

    /// Current mode
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Current listening session
    #[must_use]
    pub const fn recording(&self) -> &RecordingSession {
        &self.recording
    }

    /// Wake word detector
    #[must_use]
    pub const fn detector(&self) -> &WakeWordDetector {
        &self.detector
    }

    /// Outbound channel
    #[must_use]
    pub const fn channel(&self) -> &C {
        &self.channel
    }

    /// Swap in a new channel after a reconnect
    pub fn replace_channel(&mut self, channel: C) {
        self.channel = channel;
    }

    /// Route a captured chunk according to the mode
    ///
    /// # Errors
    ///
    /// Returns [`Error::Channel`] if forwarding failed; the controller is
    /// already back in `Sleep` when this is returned
    pub fn on_audio(&mut self, frame: &AudioFrame, now: Instant) -> Result<()> {
        match self.mode {
            Mode::Sleep => {
                self.recording.buffer_pre_roll(frame.bytes());
                if self.detect_wake(frame.bytes(), now) {
                    self.wake(now)?;
                }
                Ok(())
            }
            Mode::Listen => {
                let append = self.recording.append_incoming(frame.bytes());
                self.send(append)
            }
            Mode::Respond => {
                tracing::trace!(bytes = frame.bytes().len(), "dropping microphone audio while responding");
                Ok(())
            }
        }
    }

    /// Run the detector over a sleeping chunk
    fn detect_wake(&mut self, bytes: &[u8], now: Instant) -> bool {
        let resampled;
        let input = match self.detector_resampler.as_mut() {
            Some(resampler) => match resampler.process(bytes) {
                Ok(out) => {
                    resampled = out;
                    resampled.as_slice()
                }
                Err(e) => {
                    tracing::warn!(error = %e, "detector resampling failed");
                    return false;
                }
            },
            None => bytes,
        };

        self.detector.process(input, now).is_some()
    }

    /// Wake up from `Sleep`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Channel`] if the pre-roll could not be sent
    pub fn wake(&mut self, now: Instant) -> Result<()> {
        if self.mode != Mode::Sleep {
            return Ok(());
        }
        self.enter_listen(now)
    }

    /// Handle a message from the realtime API
    ///
    /// Returns a tool request when the model asked for a function call.
    pub fn on_server_event(&mut self, event: ServerEvent, now: Instant) -> Option<ToolRequest> {
        self.last_server_activity = now;

        match event {
            ServerEvent::ResponseCreated => {
                self.on_response_created();
                None
            }
            ServerEvent::ResponseAudioDelta { delta } => {
                self.on_audio_delta(&delta, now);
                None
            }
            ServerEvent::ResponseAudioDone | ServerEvent::ResponseDone => {
                if let Some(utterance) = self.utterance.as_mut()
                    && utterance.done_at.is_none()
                {
                    utterance.done_at = Some(now);
                    utterance.speaker.signal_end();
                    tracing::debug!(bytes = utterance.clock.bytes(), "response audio complete");
                }
                None
            }
            ServerEvent::ResponseOutputItemDone { item } => match item.tool_request() {
                Ok(Some(request)) => {
                    if let Some(utterance) = self.utterance.as_mut() {
                        utterance.awaiting_tool = true;
                    }
                    tracing::info!(tool = %request.name, call_id = %request.call_id, "tool call requested");
                    Some(request)
                }
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring output item");
                    None
                }
            },
            ServerEvent::SpeechStarted => {
                tracing::info!("request start");
                self.recording.mark_spoken();
                None
            }
            ServerEvent::Error { error } => {
                tracing::error!(
                    kind = error.kind.as_deref().unwrap_or_default(),
                    code = error.code.as_deref().unwrap_or_default(),
                    message = error.message.as_deref().unwrap_or_default(),
                    "error from realtime api"
                );
                None
            }
            ServerEvent::Other => None,
        }
    }

    fn on_response_created(&mut self) {
        match self.mode {
            Mode::Sleep => {
                tracing::debug!("ignoring response while asleep");
            }
            Mode::Listen => {
                tracing::info!("response start");
                self.mode = Mode::Respond;

                if self.settings.save_recordings
                    && let Err(e) = self.recording.save_recording(&self.settings.recording_dir)
                {
                    tracing::warn!(error = %e, "failed to save recording");
                }

                self.open_utterance();
            }
            Mode::Respond => {
                // A follow-up to a tool call keeps speaking on the same speaker
                if let Some(utterance) = self.utterance.as_mut()
                    && utterance.awaiting_tool
                {
                    utterance.awaiting_tool = false;
                    utterance.done_at = None;
                    utterance.drained_at = None;
                    tracing::debug!("tool follow-up response");
                    return;
                }

                tracing::debug!("new response while responding, replacing speaker");
                self.utterance = None;
                self.open_utterance();
            }
        }
    }

    fn open_utterance(&mut self) {
        match self.speakers.open(self.format) {
            Ok(speaker) => self.utterance = Some(Utterance::new(speaker, self.format)),
            Err(e) => self.on_device_error(&e),
        }
    }

    fn on_audio_delta(&mut self, delta: &str, now: Instant) {
        if self.mode != Mode::Respond {
            tracing::trace!("dropping response audio outside respond");
            return;
        }
        let Some(utterance) = self.utterance.as_mut() else {
            return;
        };

        let chunk = match ServerEvent::decode_delta(delta) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring audio delta");
                return;
            }
        };

        utterance.clock.record(chunk.len(), now);
        if let Err(e) = utterance.speaker.write(&chunk) {
            self.on_device_error(&e);
        }
    }

    /// Check timers; call at least once a second
    pub fn on_tick(&mut self, now: Instant) {
        match self.mode {
            Mode::Sleep => {}
            Mode::Listen => {
                let idle = now.saturating_duration_since(self.recording.start_time());
                if !self.recording.has_spoken() && idle > self.settings.sleep_timeout {
                    tracing::info!(
                        timeout_secs = self.settings.sleep_timeout.as_secs_f32(),
                        "inactive, going to sleep"
                    );
                    self.enter_sleep();
                }
            }
            Mode::Respond => {
                let margin = self.settings.playback_margin;
                let finished = self.utterance.as_mut().is_some_and(|u| u.is_finished(now, margin));
                if finished {
                    tracing::info!("response end");
                    self.utterance = None;
                    if let Err(e) = self.enter_listen(now) {
                        tracing::warn!(error = %e, "could not resume listening");
                    }
                    return;
                }

                let draining = self.utterance.as_ref().is_some_and(|u| u.done_at.is_some() && !u.awaiting_tool);
                let quiet = now.saturating_duration_since(self.last_server_activity);
                if !draining && quiet > self.settings.response_timeout {
                    tracing::warn!(quiet_secs = quiet.as_secs(), "response stalled, going to sleep");
                    self.enter_sleep();
                }
            }
        }
    }

    /// Send a tool result and ask for the follow-up response
    ///
    /// Results that arrive after the turn ended are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Channel`] if the channel closed meanwhile
    pub fn send_tool_result(&mut self, call_id: String, output: String) -> Result<()> {
        let awaiting = self.mode == Mode::Respond && self.utterance.as_ref().is_some_and(|u| u.awaiting_tool);
        if !awaiting {
            tracing::info!(call_id = %call_id, "turn is over, dropping tool result");
            return Ok(());
        }

        self.send(ClientEvent::function_output(call_id, output))?;
        self.send(ClientEvent::ResponseCreate)
    }

    /// The realtime channel closed or failed
    pub fn on_channel_closed(&mut self, reason: Option<&str>) {
        if self.mode != Mode::Sleep {
            tracing::warn!(reason = reason.unwrap_or("unknown"), "realtime channel lost, going to sleep");
        }
        self.enter_sleep();
    }

    /// A capture or playback device failed
    pub fn on_device_error(&mut self, error: &Error) {
        tracing::error!(error = %error, "audio device failure, going to sleep");
        self.enter_sleep();
    }

    fn send(&mut self, event: ClientEvent) -> Result<()> {
        if let Err(e) = self.channel.send(event) {
            self.on_channel_closed(Some(&e.to_string()));
            return Err(e);
        }
        Ok(())
    }

    fn enter_listen(&mut self, now: Instant) -> Result<()> {
        let previous = self.mode;
        self.mode = Mode::Listen;
        self.recording.reset(now);
        tracing::info!(from = ?previous, "listening");

        if previous == Mode::Sleep {
            let pre_roll = self.recording.flush_pre_roll();
            if !pre_roll.is_empty() {
                tracing::debug!(bytes = pre_roll.len(), "sending pre-roll");
                self.send(ClientEvent::audio_append(&pre_roll))?;
            }
        }
        Ok(())
    }

    fn enter_sleep(&mut self) {
        if self.mode == Mode::Sleep && self.utterance.is_none() {
            return;
        }
        self.mode = Mode::Sleep;
        self.utterance = None;
        self.detector.reset();
        if let Some(resampler) = self.detector_resampler.as_mut() {
            resampler.reset();
        }
        tracing::debug!("sleeping");
    }
}
