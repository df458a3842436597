//! Callbacks out of a running session.
//!
//! [`SessionObserver`] methods run on the session loop, so they should return
//! quickly. [`TranscriptSink`] persistence runs on a spawned task and may be slow.

use super::state::{ConnectionState, ConversationMessage};
use crate::protocol::ServerEvent;
use crate::turn::TurnState;
use async_trait::async_trait;

/// Notices the caller should surface to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// The service reported an error; the session stays open
    ServiceError(String),
    /// The session is over
    SessionEnded {
        initiated_by_user: bool,
        reason: String,
    },
}

/// Receives session activity. Every method has a no-op default.
pub trait SessionObserver: Send + Sync {
    /// Once per decoded inbound event, including unknown ones.
    fn on_event(&self, _event: &ServerEvent) {}

    /// RMS loudness of each captured frame.
    fn on_audio_level(&self, _level: f32) {}

    fn on_state_change(&self, _state: &ConnectionState) {}

    fn on_turn_change(&self, _state: TurnState) {}

    fn on_message(&self, _message: &ConversationMessage) {}

    fn on_notice(&self, _notice: &SessionNotice) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Persists finished conversation messages.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn persist(&self, message: ConversationMessage) -> anyhow::Result<()>;
}
