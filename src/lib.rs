//! # Realtime Voice Engine
//!
//! Client side of a realtime voice conversation with a speech-to-speech model.
//!
//! A [`SessionEngine`] obtains a short-lived credential, opens a control
//! channel (WebRTC data channel or WebSocket), streams microphone audio as
//! base64 PCM16 events and keeps the user and the assistant from talking over
//! each other.
//!
//! ## Module Structure:
//! - **audio**: Capture, codec, frame queue and playback
//! - **protocol**: JSON events exchanged with the service
//! - **signaling**: Credentials, SDP negotiation and transports
//! - **turn**: Who is allowed to speak
//! - **session**: The engine and its handle
//! - **config**: Layered application configuration
//! - **error**: Error types for each layer

pub mod audio;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod turn;

pub use config::AppConfig;
pub use error::{ConnectError, EngineError};
pub use session::{
    ConnectionState, ConversationMessage, EngineOptions, SessionConfig, SessionEngine,
    SessionHandle, SessionNotice, SessionObserver,
};
pub use turn::{TurnCoordinator, TurnState};
