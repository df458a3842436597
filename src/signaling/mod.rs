//! # Signaling
//!
//! Getting from "no session" to "open control channel":
//! 1. **token**: obtain a short-lived credential from the token service
//! 2. **client**: exchange SDP offer/answer with the negotiation endpoint
//! 3. **webrtc** / **websocket**: build the transport and hand inbound traffic to the session loop

pub mod client;
pub mod token;
pub mod transport;
pub mod webrtc;
pub mod websocket;

pub use client::SignalingClient;
pub use token::{CredentialProvider, CredentialRequest, EphemeralCredential, HttpCredentialProvider};
pub use transport::{Connector, Transport, TransportEvent};
pub use webrtc::WebRtcConnector;
pub use websocket::WebSocketConnector;
