//! Error types for hark

use thiserror::Error;

/// Result type alias for hark operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the assistant
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Wake word model could not be loaded
    #[error("model load error: {0}")]
    ModelLoad(String),

    /// Wake word inference failed for a single chunk
    #[error("inference error: {0}")]
    Inference(String),

    /// Capture or playback device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Realtime channel closed or errored
    #[error("channel error: {0}")]
    Channel(String),

    /// Inbound message with unexpected or missing fields
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Tool execution error
    #[error("tool error: {0}")]
    Tool(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WAV encoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "io error: gone");
    }
}
