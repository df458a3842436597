//! # WebSocket Transport
//!
//! Fallback control channel for environments without peer connections. The
//! socket itself is the control channel: every text frame is one event.
//!
//! ## Connection:
//! - URL: the credential's endpoint if the token service supplied one, else the configured URL
//! - `?model=<model>` is appended when the URL has no query
//! - Headers: `Authorization: Bearer <credential>` and `OpenAI-Beta: realtime=v1`

use super::token::EphemeralCredential;
use super::transport::{Connector, Transport, TransportEvent};
use crate::error::SignalingError;
use crate::session::SessionConfig;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn session_url(&self, credential: &EphemeralCredential, model: &str) -> String {
        let base = credential.endpoint().unwrap_or(self.url.as_str());
        if base.contains('?') {
            base.to_string()
        } else {
            format!("{}?model={}", base, model)
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        credential: EphemeralCredential,
        config: &SessionConfig,
        inbound: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, SignalingError> {
        if credential.is_expired() {
            return Err(SignalingError::CredentialExpired);
        }

        let url = self.session_url(&credential, &config.model);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.value()))
            .map_err(|e| SignalingError::Transport(format!("invalid credential header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
        request
            .headers_mut()
            .insert("openai-beta", HeaderValue::from_static("realtime=v1"));

        debug!(url = %url, "Opening WebSocket control channel");
        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(map_ws_error)?;
        let (sink, mut stream) = socket.split();

        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(TransportEvent::Message(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "server closed the connection".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "connection ended".to_string(),
                }
            };
            let _ = inbound.send(TransportEvent::Closed(reason)).await;
        });

        info!("WebSocket control channel open");
        Ok(Arc::new(WebSocketTransport {
            sink: Mutex::new(sink),
            reader: std::sync::Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        }))
    }
}

struct WebSocketTransport {
    sink: Mutex<WsSink>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, text: String) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Transport("transport closed".to_string()));
        }
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Stop the reader first so a local close is not reported as a remote loss
        let reader = self.reader.lock().ok().and_then(|mut slot| slot.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        if let Err(e) = self.sink.lock().await.close().await {
            warn!("WebSocket close failed: {}", e);
        }
        info!("WebSocket control channel closed");
    }

    fn kind(&self) -> &'static str {
        "websocket"
    }
}

fn map_ws_error(err: WsError) -> SignalingError {
    match err {
        WsError::Http(response) => SignalingError::NegotiationRejected {
            status: response.status().as_u16(),
            body: response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default(),
        },
        other => SignalingError::Transport(other.to_string()),
    }
}
