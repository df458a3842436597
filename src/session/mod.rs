//! # Voice Sessions
//!
//! ## Module Structure:
//! - **state**: Session identity, configuration, lifecycle and metrics
//! - **observer**: Callbacks the caller implements to follow a session
//! - **engine**: Connect sequence and the per-session loop

pub mod engine;
pub mod observer;
pub mod state;

pub use engine::{EngineOptions, SessionEngine, SessionHandle};
pub use observer::{NoopObserver, SessionNotice, SessionObserver, TranscriptSink};
pub use state::{
    ConnectionState, ConversationMessage, MetricsSnapshot, Session, SessionConfig,
    SessionConfigPatch, SessionMetrics,
};
