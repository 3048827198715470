//! Realtime API message types
//!
//! Only the subset of the protocol the assistant produces or consumes is
//! modelled. Unknown inbound types deserialize to [`ServerEvent::Other`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Messages sent to the realtime API
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Configure the session
    #[serde(rename = "session.update")]
    SessionUpdate {
        /// Session settings
        session: SessionConfig,
    },

    /// Append base64 PCM to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64 encoded PCM16
        audio: String,
    },

    /// Add an item to the conversation
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        /// Item to add
        item: ConversationItem,
    },

    /// Ask the model for a response
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    /// Build an audio append for raw PCM bytes
    #[must_use]
    pub fn audio_append(pcm: &[u8]) -> Self {
        Self::InputAudioBufferAppend {
            audio: STANDARD.encode(pcm),
        }
    }

    /// Build a function call result
    #[must_use]
    pub fn function_output(call_id: String, output: String) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput { call_id, output },
        }
    }

    /// Build a system message carrying the given text
    #[must_use]
    pub fn system_message(text: String) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem::Message {
                role: "system".to_string(),
                content: vec![ContentPart::InputText { text }],
            },
        }
    }

    /// Wire type name, for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            Self::ConversationItemCreate { .. } => "conversation.item.create",
            Self::ResponseCreate => "response.create",
        }
    }
}

/// Conversation items the client creates
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    /// Plain message
    Message {
        /// Speaker role
        role: String,
        /// Message parts
        content: Vec<ContentPart>,
    },
    /// Result of a function call requested by the model
    FunctionCallOutput {
        /// Id of the call being answered
        call_id: String,
        /// JSON encoded result
        output: String,
    },
}

/// Part of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text input
    InputText {
        /// Text content
        text: String,
    },
}

/// `session.update` payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    /// Input audio encoding
    pub input_audio_format: String,
    /// Output audio encoding
    pub output_audio_format: String,
    /// Response modalities
    pub modalities: Vec<String>,
    /// Assistant voice
    pub voice: String,
    /// System instructions
    pub instructions: String,
    /// Server-side voice activity detection
    pub turn_detection: TurnDetection,
    /// Function schemas
    pub tools: Vec<Value>,
}

impl SessionConfig {
    /// PCM16 audio in and out with server VAD
    #[must_use]
    pub fn pcm16(voice: String, instructions: String, tools: Vec<Value>) -> Self {
        Self {
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            modalities: vec!["audio".to_string(), "text".to_string()],
            voice,
            instructions,
            turn_detection: TurnDetection::default(),
            tools,
        }
    }
}

/// Server VAD settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetection {
    /// Detection mode
    #[serde(rename = "type")]
    pub kind: String,
    /// Activation threshold
    pub threshold: f32,
    /// Audio kept before detected speech
    pub prefix_padding_ms: u32,
    /// Silence that ends a turn
    pub silence_duration_ms: u32,
    /// Respond automatically at end of turn
    pub create_response: bool,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.3,
            prefix_padding_ms: 200,
            silence_duration_ms: 800,
            create_response: true,
        }
    }
}

/// Messages received from the realtime API
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// A response started
    #[serde(rename = "response.created")]
    ResponseCreated,

    /// A chunk of response audio
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta {
        /// Base64 encoded PCM16
        delta: String,
    },

    /// All audio of the response was sent
    #[serde(rename = "response.audio.done")]
    ResponseAudioDone,

    /// The response finished
    #[serde(rename = "response.done")]
    ResponseDone,

    /// An output item finished (function calls arrive here)
    #[serde(rename = "response.output_item.done")]
    ResponseOutputItemDone {
        /// The finished item
        item: OutputItem,
    },

    /// Server VAD heard speech
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    /// API level error
    #[serde(rename = "error")]
    Error {
        /// Error details
        error: ApiError,
    },

    /// Any other message type
    #[serde(other)]
    Other,
}

impl ServerEvent {
    /// Parse an inbound text frame
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if the frame is not a valid event
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::MalformedMessage(e.to_string()))
    }

    /// Wire type name, for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ResponseCreated => "response.created",
            Self::ResponseAudioDelta { .. } => "response.audio.delta",
            Self::ResponseAudioDone => "response.audio.done",
            Self::ResponseDone => "response.done",
            Self::ResponseOutputItemDone { .. } => "response.output_item.done",
            Self::SpeechStarted => "input_audio_buffer.speech_started",
            Self::Error { .. } => "error",
            Self::Other => "other",
        }
    }

    /// Decode the audio of a delta event
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if the payload is not valid base64
    pub fn decode_delta(delta: &str) -> Result<Vec<u8>> {
        STANDARD
            .decode(delta)
            .map_err(|e| Error::MalformedMessage(format!("invalid audio delta: {e}")))
    }
}

/// Output item of a response
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutputItem {
    /// Item type (`message`, `function_call`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Function name
    #[serde(default)]
    pub name: Option<String>,
    /// Call id to answer
    #[serde(default)]
    pub call_id: Option<String>,
    /// JSON encoded arguments
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Error reported by the API
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    /// Error category
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Machine readable code
    #[serde(default)]
    pub code: Option<String>,
    /// Human readable message
    #[serde(default)]
    pub message: Option<String>,
}

/// A function call the model asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRequest {
    /// Tool name
    pub name: String,
    /// Call id to answer
    pub call_id: String,
    /// JSON encoded arguments
    pub arguments: String,
}

impl OutputItem {
    /// Extract a function call, if this item is one
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`] if a function call lacks its name or id
    pub fn tool_request(&self) -> Result<Option<ToolRequest>> {
        if self.kind != "function_call" {
            return Ok(None);
        }

        let name = self
            .name
            .clone()
            .ok_or_else(|| Error::MalformedMessage("function_call without name".to_string()))?;
        let call_id = self
            .call_id
            .clone()
            .ok_or_else(|| Error::MalformedMessage("function_call without call_id".to_string()))?;

        Ok(Some(ToolRequest {
            name,
            call_id,
            arguments: self.arguments.clone().unwrap_or_else(|| "{}".to_string()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_append_serialization() {
        let event = ClientEvent::audio_append(&[1, 2, 3]);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"type": "input_audio_buffer.append", "audio": "AQID"}));
    }

    #[test]
    fn test_response_create_serialization() {
        let value = serde_json::to_value(ClientEvent::ResponseCreate).unwrap();
        assert_eq!(value, json!({"type": "response.create"}));
    }

    #[test]
    fn test_function_output_serialization() {
        let event = ClientEvent::function_output("call_1".to_string(), "{\"ok\":true}".to_string());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "conversation.item.create",
                "item": {"type": "function_call_output", "call_id": "call_1", "output": "{\"ok\":true}"}
            })
        );
    }

    #[test]
    fn test_session_update_shape() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig::pcm16("ash".to_string(), "be brief".to_string(), vec![]),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["session"]["voice"], "ash");
        assert_eq!(value["session"]["input_audio_format"], "pcm16");
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(value["session"]["turn_detection"]["silence_duration_ms"], 800);
    }

    #[test]
    fn test_parse_known_events() {
        assert_eq!(
            ServerEvent::parse(r#"{"type":"response.created","response":{"id":"r1"}}"#).unwrap(),
            ServerEvent::ResponseCreated
        );
        assert_eq!(
            ServerEvent::parse(r#"{"type":"response.audio.delta","delta":"AQID","item_id":"x"}"#).unwrap(),
            ServerEvent::ResponseAudioDelta {
                delta: "AQID".to_string()
            }
        );
        assert_eq!(
            ServerEvent::parse(r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":10}"#).unwrap(),
            ServerEvent::SpeechStarted
        );
    }

    #[test]
    fn test_parse_unknown_event() {
        assert_eq!(
            ServerEvent::parse(r#"{"type":"session.created","session":{}}"#).unwrap(),
            ServerEvent::Other
        );
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(ServerEvent::parse("not json"), Err(Error::MalformedMessage(_))));
        assert!(matches!(
            ServerEvent::parse(r#"{"type":"response.audio.delta"}"#),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_tool_request_extraction() {
        let event = ServerEvent::parse(
            r#"{"type":"response.output_item.done","item":{"type":"function_call","name":"webSearch","call_id":"c1","arguments":"{\"query\":\"rust\"}"}}"#,
        )
        .unwrap();

        let ServerEvent::ResponseOutputItemDone { item } = event else {
            panic!("unexpected event");
        };
        let request = item.tool_request().unwrap().unwrap();
        assert_eq!(request.name, "webSearch");
        assert_eq!(request.call_id, "c1");

        let message = OutputItem {
            kind: "message".to_string(),
            name: None,
            call_id: None,
            arguments: None,
        };
        assert!(message.tool_request().unwrap().is_none());
    }
}
