use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::DecodeError;

pub const MIME_AUDIO_PCM: &str = "audio/pcm";
pub const MIME_TEXT_PLAIN: &str = "text/plain";

/// One capture quantum: mono samples at the capture rate, as float and as PCM16.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub samples: Vec<f32>,
    pub pcm: Vec<i16>,
}

impl AudioBlock {
    pub fn from_samples(samples: Vec<f32>) -> Self {
        let pcm = super::pcm::f32_to_pcm16(&samples);
        Self { samples, pcm }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Body of `POST send/{userId}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OutboundChunk {
    pub mime_type: String,
    pub data: String,
    pub is_partial: bool,
}

impl OutboundChunk {
    pub fn audio(pcm: &[i16], is_partial: bool) -> Self {
        Self {
            mime_type: MIME_AUDIO_PCM.to_string(),
            data: super::pcm::encode_base64_pcm16(pcm),
            is_partial,
        }
    }
}

/// Media frame pushed by the agent over the event channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InboundFrame {
    pub mime_type: String,
    pub data: String,
}

/// End-of-turn signal pushed by the agent.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurnSignal {
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

/// Any JSON payload carried by one server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentFrame {
    Media(InboundFrame),
    Turn(TurnSignal),
}

impl AgentFrame {
    /// A `mime_type` key makes the payload a media frame, which must then be
    /// complete. Otherwise a turn signal needs at least one of its keys.
    pub fn from_json(data: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(data)?;
        let Some(object) = value.as_object() else {
            return Err(DecodeError::UnknownFrame);
        };
        if object.contains_key("mime_type") {
            return Ok(AgentFrame::Media(serde_json::from_value(value)?));
        }
        if object.contains_key("turn_complete") || object.contains_key("interrupted") {
            return Ok(AgentFrame::Turn(serde_json::from_value(value)?));
        }
        Err(DecodeError::UnknownFrame)
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Agent,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct AgentMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub text: String,
}

/// Observable output of a running session, consumed by the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status(ConnectionStatus),
    Message(AgentMessage),
    TurnComplete { interrupted: bool },
}
