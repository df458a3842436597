//! # Session State
//!
//! Data owned by a single voice session: its identity and lifecycle, the
//! configuration it was negotiated with, the messages it produces and the
//! counters it keeps.
//!
//! ## Key Rust Concepts:
//! - **Atomics for metrics**: the audio thread and the session loop both bump counters,
//!   so [`SessionMetrics`] uses `AtomicU64` instead of a lock
//! - **Snapshots**: [`SessionMetrics::snapshot`] copies the counters into a plain
//!   `Serialize` struct that callers can log or return without holding references

use crate::protocol::{
    ClientEvent, Modality, ResponseOptions, Role, SessionUpdate, TranscriptionSettings,
    TurnDetection,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Lifecycle of a session's connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Closed,
    /// The connection was lost or could not be established; carries the reason
    Failed(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed(_))
    }
}

/// Everything negotiated with the remote service for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub model: String,
    pub voice: String,
    pub modalities: Vec<Modality>,
    pub instructions: String,
    /// Summary of earlier conversations, appended to the instructions
    pub memory_context: Option<String>,
    /// Instructions for a scripted opening response
    pub greeting: Option<String>,
    pub temperature: f32,
    /// Model used to transcribe the user's speech; `None` disables transcription
    pub transcription_model: Option<String>,
    pub turn_detection: TurnDetection,
    pub sample_rate: u32,
    pub start_muted: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-realtime-preview-2024-12-17".to_string(),
            voice: "alloy".to_string(),
            modalities: vec![Modality::Text, Modality::Audio],
            instructions: String::new(),
            memory_context: None,
            greeting: None,
            temperature: 0.8,
            transcription_model: Some("whisper-1".to_string()),
            turn_detection: TurnDetection::default(),
            sample_rate: 24000,
            start_muted: false,
        }
    }
}

impl SessionConfig {
    /// Instructions with the memory context appended, if there is any.
    pub fn effective_instructions(&self) -> String {
        match self.memory_context.as_deref().map(str::trim) {
            Some(memory) if !memory.is_empty() => format!(
                "{}\n\nContext from previous conversations:\n{}",
                self.instructions, memory
            ),
            _ => self.instructions.clone(),
        }
    }

    /// The full `session.update` event describing this configuration.
    pub fn to_update_event(&self) -> ClientEvent {
        ClientEvent::SessionUpdate {
            session: SessionUpdate {
                modalities: Some(self.modalities.clone()),
                instructions: Some(self.effective_instructions()),
                voice: Some(self.voice.clone()),
                input_audio_format: Some("pcm16".to_string()),
                output_audio_format: Some("pcm16".to_string()),
                input_audio_transcription: self
                    .transcription_model
                    .clone()
                    .map(|model| TranscriptionSettings { model }),
                turn_detection: Some(self.turn_detection.clone()),
                temperature: Some(self.temperature),
                max_response_output_tokens: Some(4096),
            },
        }
    }

    /// `response.create` for the scripted greeting, if one is configured.
    pub fn greeting_event(&self) -> Option<ClientEvent> {
        self.greeting.as_ref().map(|greeting| ClientEvent::ResponseCreate {
            response: Some(ResponseOptions {
                modalities: Some(self.modalities.clone()),
                instructions: Some(greeting.clone()),
                voice: None,
            }),
        })
    }

    /// Merge a partial update.
    pub fn apply(&mut self, patch: SessionConfigPatch) {
        if let Some(instructions) = patch.instructions {
            self.instructions = instructions;
        }
        if let Some(voice) = patch.voice {
            self.voice = voice;
        }
        if let Some(modalities) = patch.modalities {
            self.modalities = modalities;
        }
        if let Some(memory) = patch.memory_context {
            self.memory_context = Some(memory).filter(|m| !m.trim().is_empty());
        }
        if let Some(temperature) = patch.temperature {
            self.temperature = temperature;
        }
    }
}

/// Partial configuration change for a live session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionConfigPatch {
    pub instructions: Option<String>,
    pub voice: Option<String>,
    pub modalities: Option<Vec<Modality>>,
    /// An empty string clears the memory context
    pub memory_context: Option<String>,
    pub temperature: Option<f32>,
}

impl SessionConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One voice session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub state: ConnectionState,
    pub config: SessionConfig,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ConnectionState::Idle,
            config,
            created_at: Utc::now(),
        }
    }
}

/// A finished utterance from either side of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Counters shared by the audio thread and the session loop.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub frames_captured: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_suppressed: AtomicU64,
    pub chunks_sent: AtomicU64,
    pub events_received: AtomicU64,
    pub unknown_events: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub decode_errors: AtomicU64,
}

/// Point-in-time copy of [`SessionMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_suppressed: u64,
    pub chunks_sent: u64,
    pub events_received: u64,
    pub unknown_events: u64,
    pub protocol_errors: u64,
    pub decode_errors: u64,
}

impl SessionMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_suppressed: self.frames_suppressed.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            unknown_events: self.unknown_events.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_effective_instructions_appends_memory() {
        let mut config = SessionConfig {
            instructions: "Be kind.".into(),
            ..Default::default()
        };
        assert_eq!(config.effective_instructions(), "Be kind.");

        config.memory_context = Some("Prefers evening check-ins".into());
        let combined = config.effective_instructions();
        assert!(combined.starts_with("Be kind."));
        assert!(combined.ends_with("Prefers evening check-ins"));
    }

    #[test]
    fn test_update_event_shape() {
        let config = SessionConfig {
            instructions: "Hi".into(),
            ..Default::default()
        };
        let json = crate::protocol::encode(&config.to_update_event()).unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["voice"], "alloy");
        assert_eq!(value["session"]["input_audio_format"], "pcm16");
        assert_eq!(value["session"]["input_audio_transcription"]["model"], "whisper-1");
    }

    #[test]
    fn test_greeting_only_when_configured() {
        let mut config = SessionConfig::default();
        assert!(config.greeting_event().is_none());
        config.greeting = Some("Greet the user warmly".into());
        assert!(matches!(
            config.greeting_event(),
            Some(ClientEvent::ResponseCreate { response: Some(_) })
        ));
    }

    #[test]
    fn test_patch_merges_and_clears_memory() {
        let mut config = SessionConfig {
            memory_context: Some("old".into()),
            ..Default::default()
        };
        config.apply(SessionConfigPatch {
            voice: Some("verse".into()),
            memory_context: Some(String::new()),
            ..Default::default()
        });
        assert_eq!(config.voice, "verse");
        assert!(config.memory_context.is_none());
        assert_eq!(config.temperature, 0.8);
        assert!(SessionConfigPatch::default().is_empty());
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = SessionMetrics::default();
        SessionMetrics::incr(&metrics.chunks_sent);
        SessionMetrics::incr(&metrics.chunks_sent);
        SessionMetrics::incr(&metrics.unknown_events);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.chunks_sent, 2);
        assert_eq!(snapshot.unknown_events, 1);
        assert_eq!(snapshot.frames_dropped, 0);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Failed("x".into()).is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert_eq!(ConnectionState::Failed("x".into()).as_str(), "failed");
    }
}
