//! Realtime speech API channel
//!
//! Message types and the WebSocket client. The API itself is an external
//! collaborator; only the messages the assistant uses are modelled.

mod client;
mod protocol;

pub use client::{ChannelEvent, RealtimeConnection, RealtimeSender, RealtimeSink};
pub use protocol::{
    ApiError, ClientEvent, ContentPart, ConversationItem, OutputItem, ServerEvent, SessionConfig,
    ToolRequest, TurnDetection,
};
