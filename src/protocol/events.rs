//! # Control-Channel Events
//!
//! The realtime service and the engine exchange JSON objects that all carry a
//! `type` discriminator. Outbound events are [`ClientEvent`], inbound events
//! are [`ServerEvent`].
//!
//! ## Key Rust Concepts:
//! - **#[serde(tag = "type")]**: Internally tagged enums put the variant name in the `type` field
//! - **#[serde(rename = "...")]**: Maps each variant to its dotted wire name
//! - **Closed enum + fallback**: Anything the engine does not understand becomes
//!   [`ServerEvent::Unknown`] instead of an error, so new service events never break a session
//!
//! ## Decoding Rules:
//! - Not JSON, or no string `type`: [`ProtocolError`]
//! - Known `type` with wrongly shaped fields: [`ProtocolError::Malformed`]
//! - Unknown `type`: `Ok(ServerEvent::Unknown { .. })`
//! - Unknown fields on known types are ignored

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output modality of the remote model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Server-side voice activity detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_padding_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_duration_ms: Option<u32>,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: Some(0.5),
            prefix_padding_ms: Some(300),
            silence_duration_ms: Some(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    pub model: String,
}

/// Body of `session.update`. Absent fields leave the remote value unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<Modality>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<u32>,
}

/// One part of a conversation item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "input_text")]
    InputText { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            role: Role::User,
            content: vec![ContentPart::InputText { text: text.into() }],
        }
    }
}

/// Per-response overrides for `response.create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<Modality>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

/// Events the engine sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdate },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseOptions>,
    },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ResponseCreate { .. } => "response.create",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit => "input_audio_buffer.commit",
            ClientEvent::ResponseCancel => "response.cancel",
        }
    }
}

/// Error payload of an `error` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}

/// Events the engine receives.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: Value,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Value,
    },

    /// The assistant started producing speech
    #[serde(rename = "response.audio.started")]
    AudioStarted { response_id: Option<String> },

    /// The assistant finished producing speech
    #[serde(rename = "response.audio.ended")]
    AudioEnded { response_id: Option<String> },

    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta { delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    TranscriptDone {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted { audio_start_ms: Option<u64> },

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped { audio_end_ms: Option<u64> },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Value,
    },

    #[serde(rename = "error")]
    Error {
        error: Option<ErrorDetail>,
        message: Option<String>,
    },

    /// Any event type not listed above
    #[serde(skip)]
    Unknown { event_type: String, payload: Value },
}

/// Inbound types decoded into typed variants, after alias resolution.
const KNOWN_TYPES: &[&str] = &[
    "session.created",
    "session.updated",
    "response.audio.started",
    "response.audio.ended",
    "response.audio.delta",
    "response.audio_transcript.delta",
    "response.audio_transcript.done",
    "conversation.item.input_audio_transcription.completed",
    "input_audio_buffer.speech_started",
    "input_audio_buffer.speech_stopped",
    "response.done",
    "error",
];

/// Map alternative spellings of the speech-activity events onto one name.
fn canonical_type(event_type: &str) -> &str {
    match event_type {
        "output_audio_buffer.started" | "output_audio_buffer.audio_started" => "response.audio.started",
        "output_audio_buffer.stopped" | "output_audio_buffer.audio_stopped" => "response.audio.ended",
        other => other,
    }
}

impl ServerEvent {
    pub fn event_type(&self) -> &str {
        match self {
            ServerEvent::SessionCreated { .. } => "session.created",
            ServerEvent::SessionUpdated { .. } => "session.updated",
            ServerEvent::AudioStarted { .. } => "response.audio.started",
            ServerEvent::AudioEnded { .. } => "response.audio.ended",
            ServerEvent::AudioDelta { .. } => "response.audio.delta",
            ServerEvent::TranscriptDelta { .. } => "response.audio_transcript.delta",
            ServerEvent::TranscriptDone { .. } => "response.audio_transcript.done",
            ServerEvent::InputTranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            ServerEvent::SpeechStarted { .. } => "input_audio_buffer.speech_started",
            ServerEvent::SpeechStopped { .. } => "input_audio_buffer.speech_stopped",
            ServerEvent::ResponseDone { .. } => "response.done",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Unknown { event_type, .. } => event_type,
        }
    }

    /// Human-readable message of an `error` event, nested or flat.
    pub fn error_message(&self) -> Option<String> {
        match self {
            ServerEvent::Error { error, message } => Some(
                error
                    .as_ref()
                    .and_then(|e| e.message.clone())
                    .or_else(|| message.clone())
                    .unwrap_or_else(|| "unknown service error".to_string()),
            ),
            _ => None,
        }
    }
}

/// Decode one inbound control-channel message.
pub fn decode(text: &str) -> Result<ServerEvent, ProtocolError> {
    let mut value: Value = serde_json::from_str(text)?;

    let event_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();
    let canonical = canonical_type(&event_type);

    if !KNOWN_TYPES.iter().any(|known| *known == canonical) {
        return Ok(ServerEvent::Unknown {
            event_type,
            payload: value,
        });
    }

    if canonical != event_type {
        value["type"] = Value::String(canonical.to_string());
    }

    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { event_type, source })
}

/// Encode one outbound event as JSON text.
pub fn encode(event: &ClientEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_update_wire_format() {
        let event = ClientEvent::SessionUpdate {
            session: SessionUpdate {
                modalities: Some(vec![Modality::Text, Modality::Audio]),
                voice: Some("alloy".into()),
                input_audio_format: Some("pcm16".into()),
                turn_detection: Some(TurnDetection::default()),
                ..Default::default()
            },
        };
        let value: Value = serde_json::from_str(&encode(&event).unwrap()).unwrap();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["modalities"], json!(["text", "audio"]));
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(value["session"]["turn_detection"]["silence_duration_ms"], 500);
        // Unset fields are omitted, not sent as null
        assert!(value["session"].get("instructions").is_none());
    }

    #[test]
    fn test_text_item_wire_format() {
        let event = ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text("hello"),
        };
        let value: Value = serde_json::from_str(&encode(&event).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "message",
                    "role": "user",
                    "content": [{"type": "input_text", "text": "hello"}]
                }
            })
        );
    }

    #[test]
    fn test_unit_events_carry_only_type() {
        assert_eq!(
            encode(&ClientEvent::InputAudioBufferCommit).unwrap(),
            r#"{"type":"input_audio_buffer.commit"}"#
        );
        assert_eq!(
            encode(&ClientEvent::ResponseCreate { response: None }).unwrap(),
            r#"{"type":"response.create"}"#
        );
    }

    #[test]
    fn test_decode_transcript_done() {
        let event = decode(r#"{"type":"response.audio_transcript.done","transcript":"Hi there","item_id":"x"}"#).unwrap();
        assert_eq!(
            event,
            ServerEvent::TranscriptDone {
                transcript: "Hi there".into()
            }
        );
    }

    #[test]
    fn test_decode_speech_activity_aliases() {
        let started = decode(r#"{"type":"output_audio_buffer.started","response_id":"r1"}"#).unwrap();
        assert_eq!(
            started,
            ServerEvent::AudioStarted {
                response_id: Some("r1".into())
            }
        );
        let ended = decode(r#"{"type":"response.audio.ended"}"#).unwrap();
        assert_eq!(ended, ServerEvent::AudioEnded { response_id: None });
    }

    #[test]
    fn test_decode_unknown_type_is_not_an_error() {
        let event = decode(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        match event {
            ServerEvent::Unknown { event_type, payload } => {
                assert_eq!(event_type, "rate_limits.updated");
                assert_eq!(payload["rate_limits"], json!([]));
            }
            other => panic!("expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode("not json"), Err(ProtocolError::Json(_))));
        assert!(matches!(decode(r#"{"delta":"x"}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(
            decode(r#"{"type":"response.audio.delta","delta":42}"#),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn test_error_message_nested_and_flat() {
        let nested = decode(r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad voice"}}"#).unwrap();
        assert_eq!(nested.error_message().as_deref(), Some("bad voice"));

        let flat = decode(r#"{"type":"error","message":"rate limited"}"#).unwrap();
        assert_eq!(flat.error_message().as_deref(), Some("rate limited"));

        let bare = decode(r#"{"type":"error"}"#).unwrap();
        assert_eq!(bare.error_message().as_deref(), Some("unknown service error"));
    }
}
