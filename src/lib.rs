//! hark - wake word voice assistant for a realtime speech API
//!
//! This library provides the core functionality of the assistant:
//! - Wake word detection over an ONNX model
//! - Turn taking between the user and the assistant (sleep, listen, respond)
//! - A pre-roll buffer so the first words of a request are not lost
//! - Streaming playback with drain estimation
//! - The realtime WebSocket channel and model tool calls
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   frames   ┌─────────────────────┐  append   ┌──────────────┐
//! │  Microphone   │──────────► │   TurnController    │─────────► │   Realtime   │
//! └───────────────┘            │ sleep/listen/respond│ ◄──────── │   channel    │
//!                              └──┬───────────────┬──┘  events   └──────────────┘
//!                      pre-roll   │               │ audio deltas
//!                   + wake model  ▼               ▼
//!                         ┌──────────────┐  ┌──────────────┐
//!                         │ WakeDetector │  │   Speaker    │
//!                         └──────────────┘  └──────────────┘
//! ```

pub mod assistant;
pub mod config;
pub mod error;
pub mod realtime;
pub mod tools;
pub mod turn;
pub mod voice;

pub use assistant::Assistant;
pub use config::Config;
pub use error::{Error, Result};
pub use turn::{Mode, TurnController, TurnSettings};
