//! Wake word detection
//!
//! Runs a small ONNX classifier over fixed-size chunks of 16 kHz PCM and
//! reports a detection when the score crosses the configured threshold.
//! Raw bytes are accumulated until a full chunk is available; leftovers are
//! kept for the next call.

use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};

use ndarray::Array3;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Tensor;

use crate::config::WakeConfig;
use crate::{Error, Result};

/// Runs one forward pass over a `[1, channels, samples]` tensor
pub trait InferenceBackend {
    /// Return the scalar score of the first output
    ///
    /// # Errors
    ///
    /// Returns error if inference fails
    fn infer(&mut self, input: Array3<f32>) -> Result<f32>;
}

/// ONNX Runtime session holding the wake word model
pub struct OnnxModel {
    session: Session,
}

impl OnnxModel {
    /// Load the model from disk
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] if the file is missing or not a valid model
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ModelLoad(format!("model not found: {}", path.display())));
        }

        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| Error::ModelLoad(format!("{}: {e}", path.display())))?;

        tracing::debug!(path = %path.display(), "wake word model loaded");

        Ok(Self { session })
    }
}

impl InferenceBackend for OnnxModel {
    fn infer(&mut self, input: Array3<f32>) -> Result<f32> {
        let tensor = Tensor::from_array(input).map_err(|e| Error::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| Error::Inference(e.to_string()))?;

        let output: ndarray::ArrayViewD<f32> = outputs[0]
            .try_extract_array()
            .map_err(|e| Error::Inference(e.to_string()))?;

        output
            .iter()
            .next()
            .copied()
            .ok_or_else(|| Error::Inference("empty output tensor".to_string()))
    }
}

/// Fixed-length ring of the most recent scores for one wake phrase
#[derive(Debug, Clone)]
pub struct PredictionWindow {
    scores: VecDeque<f32>,
    capacity: usize,
}

impl PredictionWindow {
    /// Create a window pre-filled with zeros
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            scores: std::iter::repeat_n(0.0, capacity).collect(),
            capacity,
        }
    }

    /// Drop the oldest score and append the newest
    pub fn push(&mut self, score: f32) {
        if self.scores.len() >= self.capacity {
            self.scores.pop_front();
        }
        self.scores.push_back(score);
    }

    /// Scores in order, oldest first
    #[must_use]
    pub fn scores(&self) -> Vec<f32> {
        self.scores.iter().copied().collect()
    }

    /// Most recent score
    #[must_use]
    pub fn last(&self) -> f32 {
        self.scores.back().copied().unwrap_or(0.0)
    }

    /// Number of trailing scores strictly above the threshold
    #[must_use]
    pub fn trailing_above(&self, threshold: f32) -> usize {
        self.scores.iter().rev().take_while(|&&s| s > threshold).count()
    }

    /// Window length
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reset every slot to zero
    pub fn clear(&mut self) {
        self.scores.iter_mut().for_each(|s| *s = 0.0);
    }
}

/// Leading-edge debounce: the first event fires, repeats within the period are dropped
#[derive(Debug, Clone)]
pub struct Cooldown {
    period: Duration,
    last_fired: Option<Instant>,
}

impl Cooldown {
    /// Create a cooldown with the given period
    #[must_use]
    pub const fn new(period: Duration) -> Self {
        Self {
            period,
            last_fired: None,
        }
    }

    /// Fire if the previous firing is older than the period
    pub fn try_fire(&mut self, now: Instant) -> bool {
        let ready = self
            .last_fired
            .is_none_or(|last| now.saturating_duration_since(last) >= self.period);
        if ready {
            self.last_fired = Some(now);
        }
        ready
    }
}

/// A debounced wake event
#[derive(Debug, Clone, PartialEq)]
pub struct WakeEvent {
    /// Wake phrase that fired
    pub wake_word: String,
    /// Score of the triggering chunk
    pub score: f32,
}

/// Detects the wake phrase in a raw 16-bit PCM stream
pub struct WakeWordDetector {
    backend: Box<dyn InferenceBackend>,
    wake_word: String,
    window: PredictionWindow,
    pending: Vec<u8>,
    chunk_samples: usize,
    model_channels: usize,
    threshold: f32,
    consecutive: usize,
    cooldown: Cooldown,
    inferences: u64,
    last_peak: f32,
}

impl WakeWordDetector {
    /// Load the ONNX model named in the config
    ///
    /// # Errors
    ///
    /// Returns [`Error::ModelLoad`] if the model cannot be loaded; there is no
    /// wake detection without it
    pub fn load_model(config: &WakeConfig) -> Result<Self> {
        let model = OnnxModel::load(&config.model_path)?;
        tracing::info!(
            wake_word = %config.wake_word,
            threshold = config.threshold,
            "wake word detector initialized"
        );
        Ok(Self::with_backend(Box::new(model), config))
    }

    /// Create a detector over any inference backend
    #[must_use]
    pub fn with_backend(backend: Box<dyn InferenceBackend>, config: &WakeConfig) -> Self {
        Self {
            backend,
            wake_word: config.wake_word.to_lowercase().trim().to_string(),
            window: PredictionWindow::new(config.window_size),
            pending: Vec::with_capacity(config.chunk_samples * 2),
            chunk_samples: config.chunk_samples.max(1),
            model_channels: config.model_channels.max(1),
            threshold: config.threshold,
            consecutive: config.consecutive.max(1),
            cooldown: Cooldown::new(config.cooldown),
            inferences: 0,
            last_peak: 0.0,
        }
    }

    /// Bytes needed for one inference pass
    #[must_use]
    pub const fn chunk_bytes(&self) -> usize {
        self.chunk_samples * 2
    }

    /// Feed raw PCM and return the highest score of the chunks completed
    ///
    /// Returns 0 when no full chunk is available yet. Inference failures are
    /// logged and count as a score of 0.
    pub fn predict(&mut self, bytes: &[u8]) -> f32 {
        self.pending.extend_from_slice(bytes);

        let mut best = 0.0f32;
        while let Some(score) = self.score_next_chunk() {
            best = best.max(score);
        }
        self.last_peak = best;
        best
    }

    /// Feed raw PCM and report a debounced wake event
    ///
    /// The threshold and consecutive-hit policy is applied after every chunk,
    /// so a hit followed by a miss within one call still fires.
    pub fn process(&mut self, bytes: &[u8], now: Instant) -> Option<WakeEvent> {
        self.pending.extend_from_slice(bytes);

        let mut best = 0.0f32;
        let mut event = None;
        while let Some(score) = self.score_next_chunk() {
            best = best.max(score);
            if event.is_some()
                || score <= self.threshold
                || self.window.trailing_above(self.threshold) < self.consecutive
            {
                continue;
            }

            if self.cooldown.try_fire(now) {
                tracing::info!(wake_word = %self.wake_word, score, "wake word detected");
                event = Some(WakeEvent {
                    wake_word: self.wake_word.clone(),
                    score,
                });
            } else {
                tracing::trace!(score, "wake word suppressed by cooldown");
            }
        }

        self.last_peak = best;
        event
    }

    /// Run inference on the next buffered chunk, if one is complete
    fn score_next_chunk(&mut self) -> Option<f32> {
        let chunk_bytes = self.chunk_bytes();
        if self.pending.len() < chunk_bytes {
            return None;
        }

        let input = self.to_tensor(&self.pending[..chunk_bytes]);
        self.pending.drain(..chunk_bytes);

        self.inferences += 1;
        let score = match self.backend.infer(input) {
            Ok(score) if score.is_finite() => score,
            Ok(score) => {
                tracing::warn!(score, "non-finite wake score, ignoring");
                0.0
            }
            Err(e) => {
                tracing::warn!(error = %e, "wake word inference failed");
                0.0
            }
        };

        self.window.push(score);
        Some(score)
    }

    /// Broadcast mono samples across every model channel, normalized to [-1, 1]
    fn to_tensor(&self, chunk: &[u8]) -> Array3<f32> {
        let samples: Vec<f32> = chunk
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
            .collect();

        let mut data = Vec::with_capacity(samples.len() * self.model_channels);
        for _ in 0..self.model_channels {
            data.extend_from_slice(&samples);
        }

        Array3::from_shape_vec((1, self.model_channels, self.chunk_samples), data)
            .unwrap_or_else(|_| Array3::zeros((1, self.model_channels, self.chunk_samples)))
    }

    /// Recent scores for the wake phrase
    #[must_use]
    pub const fn window(&self) -> &PredictionWindow {
        &self.window
    }

    /// Highest score of the most recent call
    #[must_use]
    pub const fn last_peak(&self) -> f32 {
        self.last_peak
    }

    /// Number of inference passes run so far
    #[must_use]
    pub const fn inference_count(&self) -> u64 {
        self.inferences
    }

    /// Bytes waiting for a full chunk
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Configured wake phrase
    #[must_use]
    pub fn wake_word(&self) -> &str {
        &self.wake_word
    }

    /// Detection threshold
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Discard buffered audio and scores
    pub fn reset(&mut self) {
        self.pending.clear();
        self.window.clear();
        self.last_peak = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    /// Returns scripted scores and records input shapes
    struct Scripted {
        scores: VecDeque<Result<f32>>,
        shapes: Rc<RefCell<Vec<Vec<usize>>>>,
        firsts: Rc<RefCell<Vec<f32>>>,
    }

    impl InferenceBackend for Scripted {
        fn infer(&mut self, input: Array3<f32>) -> Result<f32> {
            self.shapes.borrow_mut().push(input.shape().to_vec());
            self.firsts.borrow_mut().push(input[[0, 0, 0]]);
            self.scores.pop_front().unwrap_or(Ok(0.0))
        }
    }

    fn detector(scores: Vec<Result<f32>>) -> (WakeWordDetector, Rc<RefCell<Vec<Vec<usize>>>>, Rc<RefCell<Vec<f32>>>) {
        let shapes = Rc::new(RefCell::new(Vec::new()));
        let firsts = Rc::new(RefCell::new(Vec::new()));
        let backend = Scripted {
            scores: scores.into(),
            shapes: Rc::clone(&shapes),
            firsts: Rc::clone(&firsts),
        };
        let det = WakeWordDetector::with_backend(Box::new(backend), &WakeConfig::default());
        (det, shapes, firsts)
    }

    #[test]
    fn test_window_keeps_latest() {
        let mut window = PredictionWindow::new(3);
        assert_eq!(window.scores(), vec![0.0, 0.0, 0.0]);

        for s in [0.1, 0.2, 0.3, 0.4, 0.5] {
            window.push(s);
        }
        assert_eq!(window.scores(), vec![0.3, 0.4, 0.5]);
        assert!((window.last() - 0.5).abs() < f32::EPSILON);
        assert_eq!(window.trailing_above(0.35), 2);
    }

    #[test]
    fn test_partial_chunk_returns_zero() {
        let (mut det, shapes, _) = detector(vec![Ok(0.9)]);

        assert!(det.predict(&[0u8; 100]).abs() < f32::EPSILON);
        assert!(shapes.borrow().is_empty());
        assert_eq!(det.pending_bytes(), 100);

        let score = det.predict(&[0u8; 100]);
        assert!((score - 0.9).abs() < f32::EPSILON);
        assert_eq!(det.pending_bytes(), 8);
        assert_eq!(det.inference_count(), 1);
    }

    #[test]
    fn test_tensor_shape_and_normalization() {
        let (mut det, shapes, firsts) = detector(vec![Ok(0.1)]);

        let mut chunk = vec![0u8; 192];
        chunk[0..2].copy_from_slice(&(-16384i16).to_le_bytes());
        det.predict(&chunk);

        assert_eq!(shapes.borrow()[0], vec![1, 16, 96]);
        assert!((firsts.borrow()[0] + 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_inference_error_scores_zero() {
        let (mut det, _, _) = detector(vec![Err(Error::Inference("boom".to_string())), Ok(0.7)]);

        assert!(det.predict(&[0u8; 192]).abs() < f32::EPSILON);
        assert!((det.predict(&[0u8; 192]) - 0.7).abs() < f32::EPSILON);
        assert_eq!(det.inference_count(), 2);
    }

    #[test]
    fn test_cooldown_debounces() {
        let start = Instant::now();
        let mut cooldown = Cooldown::new(Duration::from_secs(2));

        assert!(cooldown.try_fire(start));
        assert!(!cooldown.try_fire(start + Duration::from_millis(500)));
        assert!(!cooldown.try_fire(start + Duration::from_millis(1999)));
        assert!(cooldown.try_fire(start + Duration::from_secs(2)));
    }

    #[test]
    fn test_hit_then_miss_in_one_call_fires() {
        let (mut det, _, _) = detector(vec![Ok(0.9), Ok(0.1)]);

        let event = det.process(&[0u8; 384], Instant::now()).unwrap();
        assert!((event.score - 0.9).abs() < f32::EPSILON);
        assert!((det.last_peak() - 0.9).abs() < f32::EPSILON);
        assert!((det.window().last() - 0.1).abs() < f32::EPSILON);
    }

    #[test]
    fn test_consecutive_policy() {
        let shapes = Rc::new(RefCell::new(Vec::new()));
        let firsts = Rc::new(RefCell::new(Vec::new()));
        let backend = Scripted {
            scores: vec![Ok(0.9), Ok(0.2), Ok(0.8), Ok(0.9)].into(),
            shapes,
            firsts,
        };
        let config = WakeConfig {
            consecutive: 2,
            ..WakeConfig::default()
        };
        let mut det = WakeWordDetector::with_backend(Box::new(backend), &config);
        let now = Instant::now();

        assert!(det.process(&[0u8; 192], now).is_none());
        assert!(det.process(&[0u8; 192], now).is_none());
        assert!(det.process(&[0u8; 192], now).is_none());
        assert!(det.process(&[0u8; 192], now).is_some());
    }

    #[test]
    fn test_missing_model_is_load_error() {
        let config = WakeConfig {
            model_path: "/nonexistent/model.onnx".into(),
            ..WakeConfig::default()
        };
        assert!(matches!(WakeWordDetector::load_model(&config), Err(Error::ModelLoad(_))));
    }
}
