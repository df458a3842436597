//! # Error Handling
//!
//! Every stage of a voice session fails in its own way, so each stage gets its
//! own error enum. The engine composes them into [`ConnectError`] for the
//! connection sequence and [`EngineError`] for calls on a live session.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### thiserror
//! - **#[derive(Error)]**: Generates `std::error::Error` and `Display` from the `#[error(...)]` attributes
//! - **#[from]**: Generates a `From` impl so `?` converts the inner error automatically
//! - **#[source]**: Keeps the underlying cause available through `Error::source()`
//!
//! ### Result aliases
//! - `EngineResult<T>` shortens the signatures of every `SessionHandle` call.

use std::time::Duration;
use thiserror::Error;

/// Failures acquiring or running the microphone.
///
/// Permission problems are kept apart from missing hardware so the caller can
/// tell the user which one to fix.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The operating system or user refused microphone access
    #[error("microphone permission denied")]
    PermissionDenied,

    /// No usable input device, or the device rejected the requested format
    #[error("audio input device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device was opened but the stream could not be started
    #[error("audio stream error: {0}")]
    Stream(String),

    /// The requested capture format cannot produce frames
    #[error("invalid capture format: {0}")]
    InvalidFormat(String),
}

/// Failures turning an inbound audio payload back into samples.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid base64 audio payload: {0}")]
    Base64(String),

    #[error("PCM16 payload has odd byte length {0}")]
    OddLength(usize),

    #[error("empty audio payload")]
    Empty,
}

/// Failures decoding a control-channel message.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The message was not a JSON document
    #[error("event is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The JSON document has no string `type` discriminator
    #[error("event has no string `type` field")]
    MissingType,

    /// A recognized event type whose fields have the wrong shape
    #[error("malformed `{event_type}` event: {source}")]
    Malformed {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures obtaining a short-lived credential from the token service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Request(String),

    #[error("token service returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("token response did not contain a credential")]
    MissingCredential,
}

/// Failures negotiating or running the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// The credential expired before it could be used
    #[error("session credential has expired")]
    CredentialExpired,

    /// The negotiation endpoint answered with a non-success status
    #[error("negotiation rejected with status {status}: {body}")]
    NegotiationRejected { status: u16, body: String },

    /// Network, TLS, ICE or data channel failure
    #[error("transport error: {0}")]
    Transport(String),
}

/// Why `SessionEngine::connect` failed.
///
/// Every variant is produced after the engine has already released whatever
/// the failed attempt had acquired.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("could not obtain a session credential: {0}")]
    Token(#[from] TokenError),

    #[error("session negotiation failed: {0}")]
    NegotiationFailed(#[from] SignalingError),

    #[error("microphone unavailable: {0}")]
    Device(#[from] CaptureError),

    #[error("connection timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectError {
    /// Short, actionable text suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        match self {
            ConnectError::Device(CaptureError::PermissionDenied) => {
                "Microphone access was denied. Allow microphone access and try again.".to_string()
            }
            ConnectError::Device(CaptureError::DeviceUnavailable(_)) => {
                "No microphone was found. Connect a microphone and try again.".to_string()
            }
            ConnectError::Device(CaptureError::Stream(_)) => {
                "The microphone could not be started. Check that no other application is using it.".to_string()
            }
            ConnectError::Device(CaptureError::InvalidFormat(_)) => {
                "The audio settings are invalid. Check the sample rate and frame size.".to_string()
            }
            ConnectError::Token(_) => {
                "Could not start a voice session. Please sign in again and retry.".to_string()
            }
            ConnectError::NegotiationFailed(SignalingError::CredentialExpired) => {
                "The voice session expired before it started. Please retry.".to_string()
            }
            ConnectError::NegotiationFailed(_) => {
                "Could not reach the voice service. Check your connection and retry.".to_string()
            }
            ConnectError::Timeout(_) => {
                "Connecting took too long. Check your connection and retry.".to_string()
            }
        }
    }
}

/// Failures of operations on an established session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The session has been disconnected or has failed
    #[error("session is not connected")]
    NotConnected,

    /// `send_text` was called with only whitespace
    #[error("message is empty")]
    EmptyMessage,

    /// The control channel rejected an outbound event
    #[error("failed to send event: {0}")]
    Transport(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_and_device_messages_differ() {
        let denied = ConnectError::Device(CaptureError::PermissionDenied);
        let missing = ConnectError::Device(CaptureError::DeviceUnavailable("none".into()));
        assert_ne!(denied.user_message(), missing.user_message());
        assert!(denied.user_message().contains("denied"));
    }

    #[test]
    fn test_from_conversions() {
        let err: ConnectError = SignalingError::CredentialExpired.into();
        assert!(matches!(
            err,
            ConnectError::NegotiationFailed(SignalingError::CredentialExpired)
        ));

        let err: ConnectError = TokenError::MissingCredential.into();
        assert!(matches!(err, ConnectError::Token(_)));
    }

    #[test]
    fn test_rejection_display_includes_status() {
        let err = SignalingError::NegotiationRejected {
            status: 401,
            body: "bad token".into(),
        };
        assert_eq!(err.to_string(), "negotiation rejected with status 401: bad token");
    }
}
