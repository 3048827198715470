//! Shared test utilities

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ndarray::Array3;

use hark::config::WakeConfig;
use hark::realtime::{ClientEvent, RealtimeSink, ServerEvent};
use hark::turn::{TurnController, TurnSettings};
use hark::voice::{AudioFormat, AudioFrame, InferenceBackend, SpeakerFactory, SpeakerSink, WakeWordDetector};
use hark::{Error, Result};

/// Bytes in one detector chunk (96 samples of 16-bit audio)
pub const CHUNK_BYTES: usize = 192;

/// Inference backend returning scripted scores, then zero
pub struct ScriptedBackend {
    scores: VecDeque<f32>,
    calls: Rc<RefCell<usize>>,
}

impl InferenceBackend for ScriptedBackend {
    fn infer(&mut self, _input: Array3<f32>) -> Result<f32> {
        *self.calls.borrow_mut() += 1;
        Ok(self.scores.pop_front().unwrap_or(0.0))
    }
}

/// Build a detector over scripted scores; the counter tracks inference calls
pub fn scripted_detector(scores: &[f32]) -> (WakeWordDetector, Rc<RefCell<usize>>) {
    let calls = Rc::new(RefCell::new(0));
    let backend = ScriptedBackend {
        scores: scores.iter().copied().collect(),
        calls: Rc::clone(&calls),
    };
    let detector = WakeWordDetector::with_backend(Box::new(backend), &WakeConfig::default());
    (detector, calls)
}

/// Records every message the controller sends
#[derive(Clone, Default)]
pub struct RecordingSink {
    sent: Rc<RefCell<Vec<ClientEvent>>>,
    closed: Rc<RefCell<bool>>,
}

impl RecordingSink {
    /// Messages sent so far
    pub fn sent(&self) -> Vec<ClientEvent> {
        self.sent.borrow().clone()
    }

    /// Decoded payloads of the audio appends sent so far
    pub fn appended_audio(&self) -> Vec<Vec<u8>> {
        self.sent
            .borrow()
            .iter()
            .filter_map(|event| match event {
                ClientEvent::InputAudioBufferAppend { audio } => STANDARD.decode(audio).ok(),
                _ => None,
            })
            .collect()
    }

    /// Make further sends fail
    pub fn close(&self) {
        *self.closed.borrow_mut() = true;
    }
}

impl RealtimeSink for RecordingSink {
    fn send(&mut self, event: ClientEvent) -> Result<()> {
        if *self.closed.borrow() {
            return Err(Error::Channel("closed".to_string()));
        }
        self.sent.borrow_mut().push(event);
        Ok(())
    }
}

/// What happened to one opened speaker
#[derive(Debug, Default)]
pub struct SpeakerRecord {
    pub written: Vec<u8>,
    pub writes: usize,
    pub ended: bool,
    pub dropped: bool,
}

/// Speaker factory that records each speaker it opens
#[derive(Clone, Default)]
pub struct FakeSpeakers {
    speakers: Rc<RefCell<Vec<Rc<RefCell<SpeakerRecord>>>>>,
    drained: Rc<RefCell<Option<bool>>>,
    fail: Rc<RefCell<bool>>,
}

impl FakeSpeakers {
    /// Number of speakers opened
    pub fn opened(&self) -> usize {
        self.speakers.borrow().len()
    }

    /// Record of the n-th opened speaker
    pub fn speaker(&self, index: usize) -> Rc<RefCell<SpeakerRecord>> {
        Rc::clone(&self.speakers.borrow()[index])
    }

    /// Native drain signal reported by every speaker
    pub fn set_drained(&self, drained: Option<bool>) {
        *self.drained.borrow_mut() = drained;
    }

    /// Make further opens fail
    pub fn fail_opens(&self) {
        *self.fail.borrow_mut() = true;
    }
}

struct FakeSpeaker {
    record: Rc<RefCell<SpeakerRecord>>,
    drained: Rc<RefCell<Option<bool>>>,
}

impl SpeakerSink for FakeSpeaker {
    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let mut record = self.record.borrow_mut();
        record.written.extend_from_slice(chunk);
        record.writes += 1;
        Ok(())
    }

    fn signal_end(&mut self) {
        self.record.borrow_mut().ended = true;
    }

    fn is_drained(&self) -> Option<bool> {
        *self.drained.borrow()
    }
}

impl Drop for FakeSpeaker {
    fn drop(&mut self) {
        self.record.borrow_mut().dropped = true;
    }
}

impl SpeakerFactory for FakeSpeakers {
    fn open(&self, _format: AudioFormat) -> Result<Box<dyn SpeakerSink>> {
        if *self.fail.borrow() {
            return Err(Error::Audio("no output device".to_string()));
        }
        let record = Rc::new(RefCell::new(SpeakerRecord::default()));
        self.speakers.borrow_mut().push(Rc::clone(&record));
        Ok(Box::new(FakeSpeaker {
            record,
            drained: Rc::clone(&self.drained),
        }))
    }
}

/// Controller wired to fakes at the detector's native rate
pub struct Harness {
    pub controller: TurnController<RecordingSink, FakeSpeakers>,
    pub sink: RecordingSink,
    pub speakers: FakeSpeakers,
    pub calls: Rc<RefCell<usize>>,
    pub start: Instant,
}

impl Harness {
    /// Build a controller whose detector returns `scores` in order
    pub fn new(scores: &[f32]) -> Self {
        Self::with_settings(scores, TurnSettings::default())
    }

    /// Build a controller with custom settings
    pub fn with_settings(scores: &[f32], settings: TurnSettings) -> Self {
        let (detector, calls) = scripted_detector(scores);
        let sink = RecordingSink::default();
        let speakers = FakeSpeakers::default();
        let start = Instant::now();
        let controller = TurnController::new(
            settings,
            format(),
            detector,
            sink.clone(),
            speakers.clone(),
            start,
        )
        .expect("controller");

        Self {
            controller,
            sink,
            speakers,
            calls,
            start,
        }
    }

    /// Moment `ms` milliseconds after construction
    pub fn at(&self, ms: u64) -> Instant {
        self.start + Duration::from_millis(ms)
    }

    /// Feed one chunk at `ms`
    pub fn feed(&mut self, bytes: &[u8], ms: u64) -> Result<()> {
        let now = self.at(ms);
        self.controller.on_audio(&frame(bytes), now)
    }

    /// Deliver a server event at `ms`
    pub fn event(&mut self, event: ServerEvent, ms: u64) -> Option<hark::realtime::ToolRequest> {
        let now = self.at(ms);
        self.controller.on_server_event(event, now)
    }

    /// Run timers at `ms`
    pub fn tick(&mut self, ms: u64) {
        let now = self.at(ms);
        self.controller.on_tick(now);
    }
}

/// Network format used by the harness (16 kHz, no resampling)
pub fn format() -> AudioFormat {
    AudioFormat::pcm16_mono(16000)
}

/// Wrap bytes in a frame
pub fn frame(bytes: &[u8]) -> AudioFrame {
    AudioFrame::new(bytes.to_vec(), format()).expect("aligned frame")
}

/// A detector chunk filled with one byte value
pub fn chunk(fill: u8) -> Vec<u8> {
    vec![fill; CHUNK_BYTES]
}

/// Encode PCM as an audio delta event
pub fn delta(pcm: &[u8]) -> ServerEvent {
    ServerEvent::ResponseAudioDelta {
        delta: STANDARD.encode(pcm),
    }
}
