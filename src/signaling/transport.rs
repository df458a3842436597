//! Transport seam between the session loop and the network.
//!
//! Network tasks never call into the engine. They push [`TransportEvent`]s
//! into a channel the session loop owns, and the loop pushes outbound text
//! back through [`Transport::send`].

use super::token::EphemeralCredential;
use crate::error::SignalingError;
use crate::session::SessionConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something that happened on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One UTF-8 text message
    Message(String),
    /// The channel or connection went away; carries the reason
    Closed(String),
}

/// An established control channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, text: String) -> Result<(), SignalingError>;

    /// Close the connection. Must be idempotent.
    async fn close(&self);

    fn kind(&self) -> &'static str;
}

/// Establishes a [`Transport`] for a session.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Negotiate and open the control channel.
    ///
    /// On error, anything partially set up must already be torn down.
    async fn connect(
        &self,
        credential: EphemeralCredential,
        config: &SessionConfig,
        inbound: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, SignalingError>;
}
