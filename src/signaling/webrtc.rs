//! # Peer Connection Transport
//!
//! Sets up the peer connection the realtime service expects:
//! - a STUN server for ICE
//! - a local Opus audio track, so the offer carries an audio section
//! - an ordered, reliable `oai-events` data channel used as the control channel
//!
//! The offer is sent once ICE gathering completes (no trickle), the answer is
//! applied, and `connect` returns only after the data channel opens. Remote
//! RTP audio is not decoded here; assistant audio is taken from
//! `response.audio.delta` events on the control channel.

use super::client::SignalingClient;
use super::token::EphemeralCredential;
use super::transport::{Connector, Transport, TransportEvent};
use crate::error::SignalingError;
use crate::session::SessionConfig;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Label of the control data channel.
pub const DATA_CHANNEL_LABEL: &str = "oai-events";

pub struct WebRtcConnector {
    signaling: SignalingClient,
    stun_server: String,
}

impl WebRtcConnector {
    pub fn new(signaling: SignalingClient, stun_server: impl Into<String>) -> Self {
        Self {
            signaling,
            stun_server: stun_server.into(),
        }
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, SignalingError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(rtc_error)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media).map_err(rtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![self.stun_server.clone()],
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(rtc_error)?;
        Ok(Arc::new(pc))
    }
}

/// Closes the peer connection unless disarmed, including when the connect
/// future is dropped by a timeout.
struct PeerGuard {
    pc: Arc<RTCPeerConnection>,
    armed: bool,
}

impl PeerGuard {
    fn new(pc: &Arc<RTCPeerConnection>) -> Self {
        Self {
            pc: Arc::clone(pc),
            armed: true,
        }
    }

    fn disarm(mut self) -> Arc<RTCPeerConnection> {
        self.armed = false;
        Arc::clone(&self.pc)
    }
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let pc = Arc::clone(&self.pc);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = pc.close().await {
                    warn!("Failed to close abandoned peer connection: {}", e);
                }
            });
        }
    }
}

#[async_trait]
impl Connector for WebRtcConnector {
    async fn connect(
        &self,
        credential: EphemeralCredential,
        _config: &SessionConfig,
        inbound: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, SignalingError> {
        let pc = self.new_peer_connection().await?;
        let guard = PeerGuard::new(&pc);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "microphone".to_owned(),
            "realtime-voice".to_owned(),
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_error)?;

        let channel = pc
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(rtc_error)?;

        let closed_reported = Arc::new(AtomicBool::new(false));
        let setup_failed = Arc::new(Notify::new());
        wire_callbacks(&pc, &channel, inbound, Arc::clone(&closed_reported), Arc::clone(&setup_failed));

        let (open_tx, open_rx) = oneshot::channel::<()>();
        let open_tx = Mutex::new(Some(open_tx));
        channel.on_open(Box::new(move || {
            if let Some(tx) = open_tx.lock().ok().and_then(|mut slot| slot.take()) {
                let _ = tx.send(());
            }
            Box::pin(async {})
        }));

        let offer = pc.create_offer(None).await.map_err(rtc_error)?;
        let mut gathering = pc.gathering_complete_promise().await;
        pc.set_local_description(offer).await.map_err(rtc_error)?;
        let _ = gathering.recv().await;

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| SignalingError::Transport("no local description after ICE gathering".to_string()))?;

        let answer_sdp = self.signaling.negotiate(&local.sdp, credential).await?;
        let answer = RTCSessionDescription::answer(answer_sdp).map_err(rtc_error)?;
        pc.set_remote_description(answer).await.map_err(rtc_error)?;

        tokio::select! {
            opened = open_rx => opened.map_err(|_| {
                SignalingError::Transport("data channel dropped before opening".to_string())
            })?,
            _ = setup_failed.notified() => {
                return Err(SignalingError::Transport("peer connection failed during setup".to_string()));
            }
        }

        info!(label = DATA_CHANNEL_LABEL, "Control channel open");
        Ok(Arc::new(WebRtcTransport {
            pc: guard.disarm(),
            channel,
            _track: track,
            closed: AtomicBool::new(false),
            closed_reported,
        }))
    }
}

fn wire_callbacks(
    pc: &Arc<RTCPeerConnection>,
    channel: &Arc<RTCDataChannel>,
    inbound: mpsc::Sender<TransportEvent>,
    closed_reported: Arc<AtomicBool>,
    setup_failed: Arc<Notify>,
) {
    let messages = inbound.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let messages = messages.clone();
        Box::pin(async move {
            if !msg.is_string {
                debug!(len = msg.data.len(), "Ignoring binary data channel message");
                return;
            }
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = messages.send(TransportEvent::Message(text)).await;
                }
                Err(e) => warn!("Dropping non UTF-8 data channel message: {}", e),
            }
        })
    }));

    let on_close = inbound.clone();
    let close_flag = Arc::clone(&closed_reported);
    channel.on_close(Box::new(move || {
        let on_close = on_close.clone();
        let close_flag = Arc::clone(&close_flag);
        Box::pin(async move {
            if !close_flag.swap(true, Ordering::SeqCst) {
                let _ = on_close
                    .send(TransportEvent::Closed("control channel closed".to_string()))
                    .await;
            }
        })
    }));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let inbound = inbound.clone();
        let closed_reported = Arc::clone(&closed_reported);
        let setup_failed = Arc::clone(&setup_failed);
        Box::pin(async move {
            debug!(state = %state, "Peer connection state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
            ) {
                setup_failed.notify_one();
                if !closed_reported.swap(true, Ordering::SeqCst) {
                    let _ = inbound
                        .send(TransportEvent::Closed("Connection lost".to_string()))
                        .await;
                }
            }
        })
    }));

    pc.on_track(Box::new(|track, _receiver, _transceiver| {
        info!(kind = %track.kind(), "Remote track attached");
        Box::pin(async {})
    }));
}

struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
    _track: Arc<TrackLocalStaticSample>,
    closed: AtomicBool,
    closed_reported: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn send(&self, text: String) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::Transport("transport closed".to_string()));
        }
        self.channel.send_text(text).await.map_err(rtc_error)?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // A local close is not a remote loss
        self.closed_reported.store(true, Ordering::SeqCst);
        if let Err(e) = self.channel.close().await {
            debug!("Data channel close failed: {}", e);
        }
        if let Err(e) = self.pc.close().await {
            warn!("Peer connection close failed: {}", e);
        }
        info!("Peer connection closed");
    }

    fn kind(&self) -> &'static str {
        "webrtc"
    }
}

fn rtc_error(err: webrtc::Error) -> SignalingError {
    SignalingError::Transport(err.to_string())
}
