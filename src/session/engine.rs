//! # Session Engine
//!
//! Orchestrates one voice conversation: credential, transport, session
//! configuration, microphone capture and turn-taking.
//!
//! ## Key Rust Concepts:
//! - **Actor task**: one `tokio::spawn`ed loop owns the session, the transport,
//!   the capture and the turn coordinator. Callers talk to it through a
//!   command channel, so nothing is shared mutably between tasks.
//! - **tokio::select! with `biased`**: commands are handled before network
//!   events, and network events before audio frames
//! - **watch channels**: connection and turn state are published so the
//!   [`SessionHandle`] can read them without asking the actor
//! - **Deadline**: one `timeout_at` bounds the entire connect sequence
//!
//! ## Teardown Order:
//! 1. Stop the microphone (the device thread is joined)
//! 2. Close the transport
//! 3. Deactivate turn-taking and mark the session closed or failed

use super::observer::{NoopObserver, SessionNotice, SessionObserver, TranscriptSink};
use super::state::{
    ConnectionState, ConversationMessage, MetricsSnapshot, Session, SessionConfig,
    SessionConfigPatch, SessionMetrics,
};
use crate::audio::{
    codec, frame_queue, AudioCapture, AudioFrame, AudioSink, CaptureFormat, FrameReceiver, FrameSender,
    LevelMeter, MicrophoneBackend,
};
use crate::error::{ConnectError, EngineError, EngineResult, SignalingError};
use crate::protocol::{self, ClientEvent, ConversationItem, ResponseOptions, Role, ServerEvent};
use crate::signaling::{Connector, CredentialProvider, CredentialRequest, Transport, TransportEvent};
use crate::turn::{TurnCoordinator, TurnInput, TurnState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Tuning for the engine's internal queues and the connect deadline.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub connect_timeout: Duration,
    pub frame_size: usize,
    /// Frames waiting for the session loop before new ones are dropped
    pub frame_queue_capacity: usize,
    pub inbound_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            frame_size: 4096,
            frame_queue_capacity: 32,
            inbound_capacity: 256,
        }
    }
}

/// Creates voice sessions.
pub struct SessionEngine {
    credentials: Arc<dyn CredentialProvider>,
    connector: Arc<dyn Connector>,
    microphone: Arc<dyn MicrophoneBackend>,
    observer: Arc<dyn SessionObserver>,
    transcripts: Option<Arc<dyn TranscriptSink>>,
    speaker: Option<Arc<dyn AudioSink>>,
    options: EngineOptions,
}

impl SessionEngine {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        connector: Arc<dyn Connector>,
        microphone: Arc<dyn MicrophoneBackend>,
    ) -> Self {
        Self {
            credentials,
            connector,
            microphone,
            observer: Arc::new(NoopObserver),
            transcripts: None,
            speaker: None,
            options: EngineOptions::default(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_transcript_sink(mut self, sink: Arc<dyn TranscriptSink>) -> Self {
        self.transcripts = Some(sink);
        self
    }

    pub fn with_speaker(mut self, speaker: Arc<dyn AudioSink>) -> Self {
        self.speaker = Some(speaker);
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Open a new session.
    ///
    /// ## What this does:
    /// 1. Obtains an ephemeral credential
    /// 2. Negotiates the transport and opens the control channel
    /// 3. Sends `session.update`, then the greeting `response.create` if configured
    /// 4. Starts the microphone, honoring `start_muted`
    /// 5. Spawns the session loop
    ///
    /// If any step fails or the deadline passes, everything acquired so far is
    /// released before the error is returned.
    pub async fn connect(&self, config: SessionConfig) -> Result<SessionHandle, ConnectError> {
        let mut session = Session::new(config);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (turn_tx, turn_rx) = watch::channel(TurnState::Idle);
        let reporter = StateReporter {
            session_id: session.id,
            state: state_tx,
            turn: turn_tx,
            observer: Arc::clone(&self.observer),
        };
        let metrics = Arc::new(SessionMetrics::default());

        info!(
            session_id = %session.id,
            model = %session.config.model,
            voice = %session.config.voice,
            "Connecting voice session"
        );
        session.state = ConnectionState::Connecting;
        reporter.connection(&session.state);

        let (inbound_tx, inbound_rx) = mpsc::channel(self.options.inbound_capacity.max(1));
        let (frame_tx, frame_rx) = frame_queue(self.options.frame_queue_capacity);
        // Set as soon as the transport opens so a failure or timeout can close it
        let mut opened: Option<Arc<dyn Transport>> = None;
        let deadline = Instant::now() + self.options.connect_timeout;

        let outcome = tokio::time::timeout_at(
            deadline,
            self.establish(&session.config, inbound_tx, frame_tx, &metrics, &mut opened),
        )
        .await
        .unwrap_or(Err(ConnectError::Timeout(self.options.connect_timeout)));

        let Established { transport, capture, turn } = match outcome {
            Ok(established) => established,
            Err(err) => {
                if let Some(transport) = opened.take() {
                    transport.close().await;
                }
                warn!(session_id = %session.id, error = %err, "Voice session failed to connect");
                session.state = ConnectionState::Failed(err.to_string());
                reporter.connection(&session.state);
                return Err(err);
            }
        };
        let level = capture.level_meter();

        session.state = ConnectionState::Connected;
        reporter.connection(&session.state);
        reporter.turn(turn.state());
        info!(session_id = %session.id, transport = transport.kind(), "Voice session connected");

        let (command_tx, command_rx) = mpsc::channel(32);
        let id = session.id;
        let actor = SessionActor {
            session,
            transport,
            capture,
            turn,
            frames: frame_rx,
            inbound: inbound_rx,
            commands: command_rx,
            observer: Arc::clone(&self.observer),
            transcripts: self.transcripts.clone(),
            speaker: self.speaker.clone(),
            metrics: Arc::clone(&metrics),
            reporter,
            assistant_transcript: String::new(),
        };
        let task = tokio::spawn(actor.run());

        Ok(SessionHandle {
            id,
            commands: command_tx,
            state: state_rx,
            turn: turn_rx,
            metrics,
            level,
            task: Mutex::new(Some(task)),
        })
    }

    async fn establish(
        &self,
        config: &SessionConfig,
        inbound: mpsc::Sender<TransportEvent>,
        frames: FrameSender,
        metrics: &Arc<SessionMetrics>,
        opened: &mut Option<Arc<dyn Transport>>,
    ) -> Result<Established, ConnectError> {
        let request = CredentialRequest {
            model: config.model.clone(),
            voice: config.voice.clone(),
            system_prompt: config.instructions.clone(),
            memory_context: config.memory_context.clone(),
        };
        let credential = self.credentials.issue(&request).await?;
        debug!(
            remote_session = credential.session_id().unwrap_or("-"),
            expires_at = ?credential.expires_at(),
            "Credential obtained"
        );

        let transport = self.connector.connect(credential, config, inbound).await?;
        *opened = Some(Arc::clone(&transport));

        send_event(transport.as_ref(), &config.to_update_event()).await?;
        if let Some(greeting) = config.greeting_event() {
            send_event(transport.as_ref(), &greeting).await?;
        }

        let format = CaptureFormat {
            sample_rate: config.sample_rate,
            frame_size: self.options.frame_size,
        };
        let frame_metrics = Arc::clone(metrics);
        let mut capture = AudioCapture::new(Arc::clone(&self.microphone), format, move |frame| {
            SessionMetrics::incr(&frame_metrics.frames_captured);
            if !frames.push(frame) {
                SessionMetrics::incr(&frame_metrics.frames_dropped);
            }
        });
        let mut turn = TurnCoordinator::new(capture.pause_switch());
        // No await from here on, and a capture that fails to start is released on drop
        capture.start(true)?;
        turn.apply(TurnInput::Activate {
            muted: config.start_muted,
        });
        Ok(Established {
            transport,
            capture,
            turn,
        })
    }
}

/// Everything a successful connect hands to the session loop.
struct Established {
    transport: Arc<dyn Transport>,
    capture: AudioCapture,
    turn: TurnCoordinator,
}

async fn send_event(transport: &dyn Transport, event: &ClientEvent) -> Result<(), SignalingError> {
    let text = protocol::encode(event).map_err(|e| SignalingError::Transport(e.to_string()))?;
    match event {
        ClientEvent::InputAudioBufferAppend { .. } => trace!(len = text.len(), "Sending audio chunk"),
        _ => debug!(event_type = event.event_type(), "Sending event"),
    }
    transport.send(text).await
}

/// Publishes state changes to the handle and the observer.
struct StateReporter {
    session_id: Uuid,
    state: watch::Sender<ConnectionState>,
    turn: watch::Sender<TurnState>,
    observer: Arc<dyn SessionObserver>,
}

impl StateReporter {
    fn connection(&self, next: &ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            info!(session_id = %self.session_id, state = next.as_str(), "Connection state changed");
            self.observer.on_state_change(next);
        }
    }

    fn turn(&self, next: TurnState) {
        let changed = self.turn.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            self.observer.on_turn_change(next);
        }
    }
}

enum Command {
    SendText {
        text: String,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<EngineResult<TurnState>>,
    },
    UpdateConfig {
        patch: SessionConfigPatch,
        reply: oneshot::Sender<EngineResult<()>>,
    },
    CommitAudio {
        reply: oneshot::Sender<EngineResult<()>>,
    },
    CancelResponse {
        reply: oneshot::Sender<EngineResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<EngineResult<()>>,
    },
}

impl Command {
    fn reject(self, err: EngineError) {
        match self {
            Command::SendText { reply, .. }
            | Command::UpdateConfig { reply, .. }
            | Command::CommitAudio { reply }
            | Command::CancelResponse { reply }
            | Command::Disconnect { reply } => {
                let _ = reply.send(Err(err));
            }
            Command::SetMuted { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// The single task that owns a live session.
struct SessionActor {
    session: Session,
    transport: Arc<dyn Transport>,
    capture: AudioCapture,
    turn: TurnCoordinator,
    frames: FrameReceiver,
    inbound: mpsc::Receiver<TransportEvent>,
    commands: mpsc::Receiver<Command>,
    observer: Arc<dyn SessionObserver>,
    transcripts: Option<Arc<dyn TranscriptSink>>,
    speaker: Option<Arc<dyn AudioSink>>,
    metrics: Arc<SessionMetrics>,
    reporter: StateReporter,
    /// Assistant transcript deltas since the last `done`
    assistant_transcript: String,
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            return;
                        }
                    }
                    None => {
                        debug!(session_id = %self.session.id, "Session handle dropped");
                        self.teardown(None).await;
                        return;
                    }
                },

                event = self.inbound.recv() => match event {
                    Some(TransportEvent::Message(text)) => self.handle_message(&text).await,
                    Some(TransportEvent::Closed(reason)) => {
                        self.teardown(Some(reason)).await;
                        break;
                    }
                    None => {
                        self.teardown(Some("transport ended".to_string())).await;
                        break;
                    }
                },

                Some(frame) = self.frames.recv() => self.handle_frame(frame).await,
            }
        }

        self.wait_for_disconnect().await;
    }

    /// Returns `false` once the session has been torn down.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::SendText { text, reply } => {
                let _ = reply.send(self.send_text(&text).await);
            }
            Command::SetMuted { muted, reply } => {
                let input = if muted { TurnInput::Mute } else { TurnInput::Unmute };
                let state = self.apply_turn(input);
                info!(session_id = %self.session.id, muted, "Microphone mute changed");
                let _ = reply.send(Ok(state));
            }
            Command::UpdateConfig { patch, reply } => {
                if patch.is_empty() {
                    let _ = reply.send(Ok(()));
                    return true;
                }
                self.session.config.apply(patch);
                let event = self.session.config.to_update_event();
                let _ = reply.send(self.send(&event).await);
            }
            Command::CommitAudio { reply } => {
                let _ = reply.send(self.send(&ClientEvent::InputAudioBufferCommit).await);
            }
            Command::CancelResponse { reply } => {
                if let Some(speaker) = &self.speaker {
                    speaker.clear();
                }
                // Deltas of the cancelled response must not prefix the next one
                self.assistant_transcript.clear();
                let _ = reply.send(self.send(&ClientEvent::ResponseCancel).await);
            }
            Command::Disconnect { reply } => {
                self.teardown(None).await;
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    async fn send(&mut self, event: &ClientEvent) -> EngineResult<()> {
        send_event(self.transport.as_ref(), event)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    async fn send_text(&mut self, text: &str) -> EngineResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EngineError::EmptyMessage);
        }

        self.send(&ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(text),
        })
        .await?;
        self.send(&ClientEvent::ResponseCreate {
            response: Some(ResponseOptions {
                modalities: Some(self.session.config.modalities.clone()),
                ..Default::default()
            }),
        })
        .await?;

        self.emit_message(ConversationMessage::new(Role::User, text));
        Ok(())
    }

    async fn handle_frame(&mut self, frame: AudioFrame) {
        self.observer.on_audio_level(frame.level);

        // Frames queued before the remote started speaking are discarded here
        if !self.turn.capture_enabled() {
            SessionMetrics::incr(&self.metrics.frames_suppressed);
            return;
        }

        let chunk = codec::encode(&frame.samples);
        let event = ClientEvent::InputAudioBufferAppend {
            audio: chunk.into_string(),
        };
        match self.send(&event).await {
            Ok(()) => SessionMetrics::incr(&self.metrics.chunks_sent),
            Err(e) => warn!(session_id = %self.session.id, error = %e, "Failed to send audio chunk"),
        }
    }

    async fn handle_message(&mut self, text: &str) {
        SessionMetrics::incr(&self.metrics.events_received);

        let event = match protocol::decode(text) {
            Ok(event) => event,
            Err(e) => {
                SessionMetrics::incr(&self.metrics.protocol_errors);
                warn!(session_id = %self.session.id, error = %e, "Dropping undecodable event");
                return;
            }
        };

        match &event {
            ServerEvent::AudioStarted { .. } => {
                self.apply_turn(TurnInput::RemoteStarted);
            }
            ServerEvent::AudioEnded { .. } => {
                self.apply_turn(TurnInput::RemoteEnded);
            }
            ServerEvent::AudioDelta { delta } => self.play(delta),
            ServerEvent::TranscriptDelta { delta } => self.assistant_transcript.push_str(delta),
            ServerEvent::TranscriptDone { transcript } => {
                let accumulated = std::mem::take(&mut self.assistant_transcript);
                let text = if transcript.trim().is_empty() {
                    accumulated
                } else {
                    transcript.clone()
                };
                if !text.trim().is_empty() {
                    self.emit_message(ConversationMessage::new(Role::Assistant, text.trim()));
                }
            }
            ServerEvent::InputTranscriptionCompleted { transcript } => {
                if !transcript.trim().is_empty() {
                    self.emit_message(ConversationMessage::new(Role::User, transcript.trim()));
                }
            }
            ServerEvent::Error { .. } => {
                let message = event.error_message().unwrap_or_default();
                warn!(session_id = %self.session.id, message = %message, "Service reported an error");
                self.observer.on_notice(&SessionNotice::ServiceError(message));
            }
            ServerEvent::SpeechStarted { .. } | ServerEvent::SpeechStopped { .. } => {
                debug!(event_type = event.event_type(), "Server voice activity");
            }
            ServerEvent::SessionCreated { .. }
            | ServerEvent::SessionUpdated { .. }
            | ServerEvent::ResponseDone { .. } => {
                debug!(event_type = event.event_type(), "Session event");
            }
            ServerEvent::Unknown { event_type, .. } => {
                SessionMetrics::incr(&self.metrics.unknown_events);
                debug!(event_type = %event_type, "Ignoring unknown event");
            }
        }

        self.observer.on_event(&event);
    }

    fn apply_turn(&mut self, input: TurnInput) -> TurnState {
        let state = self.turn.apply(input);
        self.reporter.turn(state);
        state
    }

    fn play(&self, delta: &str) {
        let Some(speaker) = &self.speaker else {
            return;
        };
        match codec::decode(delta, self.session.config.sample_rate) {
            Ok(audio) => speaker.play(audio),
            Err(e) => {
                SessionMetrics::incr(&self.metrics.decode_errors);
                warn!(session_id = %self.session.id, error = %e, "Dropping undecodable audio");
            }
        }
    }

    fn emit_message(&self, message: ConversationMessage) {
        self.observer.on_message(&message);

        if let Some(sink) = &self.transcripts {
            let sink = Arc::clone(sink);
            let session_id = self.session.id;
            tokio::spawn(async move {
                if let Err(e) = sink.persist(message).await {
                    warn!(session_id = %session_id, error = %e, "Failed to persist conversation message");
                }
            });
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.session.state = state;
        self.reporter.connection(&self.session.state);
    }

    /// Release the session's resources. `remote_reason` is set when the
    /// connection was lost rather than closed by the user.
    async fn teardown(&mut self, remote_reason: Option<String>) {
        self.set_state(ConnectionState::Disconnecting);

        self.capture.stop();
        let discarded = self.frames.close();
        self.transport.close().await;

        let turn = self.turn.apply(TurnInput::Deactivate);
        self.reporter.turn(turn);
        if let Some(speaker) = &self.speaker {
            speaker.clear();
        }

        let (state, notice) = match remote_reason {
            None => (
                ConnectionState::Closed,
                SessionNotice::SessionEnded {
                    initiated_by_user: true,
                    reason: "disconnected".to_string(),
                },
            ),
            Some(reason) => (
                ConnectionState::Failed(reason.clone()),
                SessionNotice::SessionEnded {
                    initiated_by_user: false,
                    reason,
                },
            ),
        };
        self.set_state(state);
        self.observer.on_notice(&notice);

        info!(
            session_id = %self.session.id,
            duration_secs = (chrono::Utc::now() - self.session.created_at).num_seconds(),
            discarded_frames = discarded,
            metrics = ?self.metrics.snapshot(),
            "Voice session ended"
        );
    }

    /// After a remote failure, keep answering commands until the caller disconnects.
    async fn wait_for_disconnect(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Disconnect { reply } => {
                    self.set_state(ConnectionState::Closed);
                    let _ = reply.send(Ok(()));
                    return;
                }
                other => other.reject(EngineError::NotConnected),
            }
        }
    }
}

/// Caller's handle to a live session.
///
/// Dropping the handle without calling [`disconnect`](Self::disconnect)
/// still tears the session down, in the background.
pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    turn: watch::Receiver<TurnState>,
    metrics: Arc<SessionMetrics>,
    level: LevelMeter,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> Uuid {
        self.id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn turn_state(&self) -> TurnState {
        *self.turn.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn subscribe_turn(&self) -> watch::Receiver<TurnState> {
        self.turn.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// RMS loudness of the most recent captured frame.
    pub fn audio_level(&self) -> f32 {
        self.level.level()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<EngineResult<T>>) -> Command,
    ) -> EngineResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| EngineError::NotConnected)?;
        response.await.map_err(|_| EngineError::NotConnected)?
    }

    /// Send a typed user message and ask for a response.
    pub async fn send_text(&self, text: impl Into<String>) -> EngineResult<()> {
        let text = text.into();
        self.request(|reply| Command::SendText { text, reply }).await
    }

    /// Mute or unmute the microphone; returns the resulting turn state.
    pub async fn set_muted(&self, muted: bool) -> EngineResult<TurnState> {
        self.request(|reply| Command::SetMuted { muted, reply }).await
    }

    /// Change session settings and re-send `session.update`.
    pub async fn update_config(&self, patch: SessionConfigPatch) -> EngineResult<()> {
        self.request(|reply| Command::UpdateConfig { patch, reply }).await
    }

    /// Ask the service to treat buffered input audio as a finished turn.
    pub async fn commit_audio(&self) -> EngineResult<()> {
        self.request(|reply| Command::CommitAudio { reply }).await
    }

    /// Interrupt the assistant's current response.
    pub async fn cancel_response(&self) -> EngineResult<()> {
        self.request(|reply| Command::CancelResponse { reply }).await
    }

    /// Tear the session down. Safe to call any number of times and from any state.
    pub async fn disconnect(&self) {
        if let Err(e) = self.request(|reply| Command::Disconnect { reply }).await {
            debug!(session_id = %self.id, error = %e, "Session already stopped");
        }
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(session_id = %self.id, error = %e, "Session task ended abnormally");
            }
        }
    }

    /// Wait until the turn state equals `target`.
    pub async fn wait_for_turn(&self, target: TurnState) -> EngineResult<()> {
        let mut turn = self.turn.clone();
        turn.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| EngineError::NotConnected)
    }

    /// Wait until the session is closed or has failed, and return that state.
    pub async fn closed(&self) -> ConnectionState {
        let mut state = self.state.clone();
        let result = state.wait_for(ConnectionState::is_terminal).await.map(|s| (*s).clone());
        match result {
            Ok(state) => state,
            Err(_) => state.borrow().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::testing::MockMicrophone;
    use crate::error::{CaptureError, TokenError};
    use crate::signaling::EphemeralCredential;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    struct StaticCredentials;

    #[async_trait]
    impl CredentialProvider for StaticCredentials {
        async fn issue(&self, _request: &CredentialRequest) -> Result<EphemeralCredential, TokenError> {
            Ok(EphemeralCredential::new("ek_test"))
        }
    }

    #[derive(Default)]
    struct MockTransport {
        sent: StdMutex<Vec<String>>,
        closed: AtomicBool,
    }

    impl MockTransport {
        fn sent_types(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|text| {
                    let value: Value = serde_json::from_str(text).unwrap();
                    value["type"].as_str().unwrap().to_string()
                })
                .collect()
        }

        fn count(&self, event_type: &str) -> usize {
            self.sent_types().iter().filter(|t| *t == event_type).count()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, text: String) -> Result<(), SignalingError> {
            if self.is_closed() {
                return Err(SignalingError::Transport("closed".into()));
            }
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn kind(&self) -> &'static str {
            "mock"
        }
    }

    #[derive(Default)]
    struct MockConnector {
        transport: Arc<MockTransport>,
        inbound: StdMutex<Option<mpsc::Sender<TransportEvent>>>,
        hang: bool,
    }

    impl MockConnector {
        fn sender(&self) -> mpsc::Sender<TransportEvent> {
            self.inbound.lock().unwrap().clone().unwrap()
        }

        async fn inject(&self, text: &str) {
            self.sender()
                .send(TransportEvent::Message(text.to_string()))
                .await
                .unwrap();
        }

        async fn lose_connection(&self, reason: &str) {
            self.sender()
                .send(TransportEvent::Closed(reason.to_string()))
                .await
                .unwrap();
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(
            &self,
            _credential: EphemeralCredential,
            _config: &SessionConfig,
            inbound: mpsc::Sender<TransportEvent>,
        ) -> Result<Arc<dyn Transport>, SignalingError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            *self.inbound.lock().unwrap() = Some(inbound);
            Ok(Arc::clone(&self.transport) as Arc<dyn Transport>)
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: AtomicU32,
        notices: StdMutex<Vec<SessionNotice>>,
        messages: StdMutex<Vec<ConversationMessage>>,
    }

    impl SessionObserver for RecordingObserver {
        fn on_event(&self, _event: &ServerEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message(&self, message: &ConversationMessage) {
            self.messages.lock().unwrap().push(message.clone());
        }

        fn on_notice(&self, notice: &SessionNotice) {
            self.notices.lock().unwrap().push(notice.clone());
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        messages: StdMutex<Vec<ConversationMessage>>,
    }

    #[async_trait]
    impl TranscriptSink for RecordingSink {
        async fn persist(&self, message: ConversationMessage) -> anyhow::Result<()> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }
    }

    struct Fixture {
        mic: Arc<MockMicrophone>,
        connector: Arc<MockConnector>,
        transport: Arc<MockTransport>,
        observer: Arc<RecordingObserver>,
        sink: Arc<RecordingSink>,
        engine: SessionEngine,
    }

    fn fixture_with(mic: MockMicrophone, connector: MockConnector, timeout: Duration) -> Fixture {
        let mic = Arc::new(mic);
        let transport = Arc::clone(&connector.transport);
        let connector = Arc::new(connector);
        let observer = Arc::new(RecordingObserver::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = SessionEngine::new(
            Arc::new(StaticCredentials),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::clone(&mic) as Arc<dyn MicrophoneBackend>,
        )
        .with_observer(Arc::clone(&observer) as Arc<dyn SessionObserver>)
        .with_transcript_sink(Arc::clone(&sink) as Arc<dyn TranscriptSink>)
        .with_options(EngineOptions {
            connect_timeout: timeout,
            frame_size: 4,
            frame_queue_capacity: 16,
            inbound_capacity: 16,
        });
        Fixture {
            mic,
            connector,
            transport,
            observer,
            sink,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockMicrophone::default(), MockConnector::default(), Duration::from_secs(2))
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn wait_turn(handle: &SessionHandle, target: TurnState) {
        tokio::time::timeout(Duration::from_secs(2), handle.wait_for_turn(target))
            .await
            .expect("turn state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_happy_path_sends_update_then_greeting() {
        let f = fixture();
        let config = SessionConfig {
            greeting: Some("Say hello".into()),
            ..Default::default()
        };

        let handle = f.engine.connect(config).await.unwrap();

        assert_eq!(f.transport.sent_types(), vec!["session.update", "response.create"]);
        assert_eq!(handle.connection_state(), ConnectionState::Connected);
        assert_eq!(handle.turn_state(), TurnState::UserCapturing);
        assert_eq!(f.mic.acquired(), 1);

        handle.disconnect().await;
        assert_eq!(handle.connection_state(), ConnectionState::Closed);
        assert_eq!(handle.turn_state(), TurnState::Idle);
        assert_eq!(f.mic.acquired(), 0);
        assert!(f.transport.is_closed());

        // Second disconnect is a no-op
        handle.disconnect().await;
        assert_eq!(handle.connection_state(), ConnectionState::Closed);
        assert!(f.observer.notices.lock().unwrap().contains(&SessionNotice::SessionEnded {
            initiated_by_user: true,
            reason: "disconnected".into(),
        }));
    }

    #[tokio::test]
    async fn test_start_muted_is_suppressed() {
        let f = fixture();
        let config = SessionConfig {
            start_muted: true,
            ..Default::default()
        };
        let handle = f.engine.connect(config).await.unwrap();
        assert_eq!(handle.turn_state(), TurnState::Suppressed);
        assert_eq!(f.transport.sent_types(), vec!["session.update"]);
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_permission_denied_rolls_back() {
        let f = fixture_with(
            MockMicrophone::failing(CaptureError::PermissionDenied),
            MockConnector::default(),
            Duration::from_secs(2),
        );

        let result = f.engine.connect(SessionConfig::default()).await;

        assert!(matches!(
            result,
            Err(ConnectError::Device(CaptureError::PermissionDenied))
        ));
        assert_eq!(f.mic.acquired(), 0);
        assert!(f.transport.is_closed());
    }

    #[tokio::test]
    async fn test_connect_times_out() {
        let connector = MockConnector {
            hang: true,
            ..Default::default()
        };
        let f = fixture_with(MockMicrophone::default(), connector, Duration::from_millis(50));

        let result = f.engine.connect(SessionConfig::default()).await;

        assert!(matches!(result, Err(ConnectError::Timeout(_))));
        assert_eq!(f.mic.acquired(), 0);
    }

    #[tokio::test]
    async fn test_remote_speech_blocks_outbound_audio() {
        let f = fixture();
        let handle = f.engine.connect(SessionConfig::default()).await.unwrap();
        let append = "input_audio_buffer.append";

        f.mic.feed(&[0.1; 4]);
        eventually("first chunk", || f.transport.count(append) == 1).await;

        f.connector.inject(r#"{"type":"response.audio.started"}"#).await;
        wait_turn(&handle, TurnState::RemoteSpeaking).await;

        for _ in 0..3 {
            f.mic.feed(&[0.2; 4]);
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(f.transport.count(append), 1);

        f.connector.inject(r#"{"type":"response.audio.ended"}"#).await;
        wait_turn(&handle, TurnState::UserCapturing).await;

        f.mic.feed(&[0.3; 4]);
        eventually("chunk after remote speech", || f.transport.count(append) == 2).await;

        handle.disconnect().await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_frames_queued_before_remote_speech_are_suppressed() {
        let f = fixture();
        let handle = f.engine.connect(SessionConfig::default()).await.unwrap();

        // Three frames reach the queue and the event lands before the loop runs,
        // so the turn changes first and the queued frames hit the gate
        f.mic.feed(&[0.1; 12]);
        f.connector.inject(r#"{"type":"response.audio.started"}"#).await;

        eventually("queued frames suppressed", || handle.metrics().frames_suppressed == 3).await;
        assert_eq!(handle.turn_state(), TurnState::RemoteSpeaking);
        assert_eq!(f.transport.count("input_audio_buffer.append"), 0);
        assert_eq!(handle.metrics().chunks_sent, 0);

        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_audio_level_follows_capture() {
        let f = fixture();
        let handle = f.engine.connect(SessionConfig::default()).await.unwrap();
        assert_eq!(handle.audio_level(), 0.0);

        f.mic.feed(&[0.5; 4]);
        assert!((handle.audio_level() - 0.5).abs() < 1e-4);

        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_mute_suppresses_capture() {
        let f = fixture();
        let handle = f.engine.connect(SessionConfig::default()).await.unwrap();

        assert_eq!(handle.set_muted(true).await.unwrap(), TurnState::Suppressed);
        f.mic.feed(&[0.4; 8]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.transport.count("input_audio_buffer.append"), 0);

        assert_eq!(handle.set_muted(false).await.unwrap(), TurnState::UserCapturing);
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_unknown_event_leaves_turn_untouched() {
        let f = fixture();
        let handle = f.engine.connect(SessionConfig::default()).await.unwrap();

        f.connector
            .inject(r#"{"type":"rate_limits.updated","rate_limits":[]}"#)
            .await;
        eventually("unknown event counted", || handle.metrics().unknown_events == 1).await;

        assert_eq!(handle.turn_state(), TurnState::UserCapturing);
        assert_eq!(handle.connection_state(), ConnectionState::Connected);
        assert_eq!(f.observer.events.load(Ordering::SeqCst), 1);
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_malformed_event_is_dropped() {
        let f = fixture();
        let handle = f.engine.connect(SessionConfig::default()).await.unwrap();

        f.connector.inject("{not json").await;
        eventually("protocol error counted", || handle.metrics().protocol_errors == 1).await;
        assert_eq!(handle.connection_state(), ConnectionState::Connected);
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_transcripts_become_messages() {
        let f = fixture();
        let handle = f.engine.connect(SessionConfig::default()).await.unwrap();

        f.connector
            .inject(r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":" I slept well "}"#)
            .await;
        f.connector
            .inject(r#"{"type":"response.audio_transcript.delta","delta":"Glad "}"#)
            .await;
        f.connector
            .inject(r#"{"type":"response.audio_transcript.delta","delta":"to hear it"}"#)
            .await;
        f.connector
            .inject(r#"{"type":"response.audio_transcript.done","transcript":""}"#)
            .await;

        eventually("messages persisted", || f.sink.messages.lock().unwrap().len() == 2).await;
        let messages = f.sink.messages.lock().unwrap().clone();
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "I slept well");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Glad to hear it");
        assert_eq!(f.observer.messages.lock().unwrap().len(), 2);

        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_text() {
        let f = fixture();
        let handle = f.engine.connect(SessionConfig::default()).await.unwrap();

        assert_eq!(handle.send_text("   ").await, Err(EngineError::EmptyMessage));
        handle.send_text("How are you?").await.unwrap();

        assert_eq!(
            f.transport.sent_types(),
            vec!["session.update", "conversation.item.create", "response.create"]
        );
        let messages = f.observer.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "How are you?");

        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_update_config_resends_session_update() {
        let f = fixture();
        let handle = f.engine.connect(SessionConfig::default()).await.unwrap();

        handle
            .update_config(SessionConfigPatch {
                voice: Some("verse".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        handle.commit_audio().await.unwrap();
        handle.cancel_response().await.unwrap();

        assert_eq!(
            f.transport.sent_types(),
            vec![
                "session.update",
                "session.update",
                "input_audio_buffer.commit",
                "response.cancel"
            ]
        );
        let last_update: Value =
            serde_json::from_str(&f.transport.sent.lock().unwrap()[1]).unwrap();
        assert_eq!(last_update["session"]["voice"], "verse");

        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_empty_config_patch_sends_nothing() {
        let f = fixture();
        let handle = f.engine.connect(SessionConfig::default()).await.unwrap();

        handle.update_config(SessionConfigPatch::default()).await.unwrap();

        assert_eq!(f.transport.sent_types(), vec!["session.update"]);
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_cancel_discards_partial_assistant_transcript() {
        let f = fixture();
        let handle = f.engine.connect(SessionConfig::default()).await.unwrap();

        f.connector
            .inject(r#"{"type":"response.audio_transcript.delta","delta":"stale"}"#)
            .await;
        eventually("delta handled", || f.observer.events.load(Ordering::SeqCst) == 1).await;

        handle.cancel_response().await.unwrap();

        f.connector
            .inject(r#"{"type":"response.audio_transcript.delta","delta":"fresh"}"#)
            .await;
        f.connector
            .inject(r#"{"type":"response.audio_transcript.done","transcript":""}"#)
            .await;

        eventually("assistant message", || f.observer.messages.lock().unwrap().len() == 1).await;
        let messages = f.observer.messages.lock().unwrap().clone();
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].content, "fresh");

        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_service_error_keeps_session_open() {
        let f = fixture();
        let handle = f.engine.connect(SessionConfig::default()).await.unwrap();

        f.connector
            .inject(r#"{"type":"error","error":{"message":"Invalid voice"}}"#)
            .await;
        eventually("service error notice", || {
            f.observer
                .notices
                .lock()
                .unwrap()
                .contains(&SessionNotice::ServiceError("Invalid voice".into()))
        })
        .await;
        assert_eq!(handle.connection_state(), ConnectionState::Connected);

        handle.disconnect().await;
    }

    #[tokio::test]
    async fn test_lost_connection_fails_then_disconnect_closes() {
        let f = fixture();
        let handle = f.engine.connect(SessionConfig::default()).await.unwrap();

        f.connector.lose_connection("Connection lost").await;
        let state = tokio::time::timeout(Duration::from_secs(2), handle.closed())
            .await
            .unwrap();

        assert_eq!(state, ConnectionState::Failed("Connection lost".into()));
        assert_eq!(f.mic.acquired(), 0);
        assert!(f.transport.is_closed());
        assert_eq!(handle.send_text("anyone there?").await, Err(EngineError::NotConnected));

        handle.disconnect().await;
        assert_eq!(handle.connection_state(), ConnectionState::Closed);
        handle.disconnect().await;
        assert_eq!(handle.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_dropping_handle_releases_microphone() {
        let f = fixture();
        let handle = f.engine.connect(SessionConfig::default()).await.unwrap();
        assert_eq!(f.mic.acquired(), 1);

        drop(handle);
        eventually("microphone released", || f.mic.acquired() == 0).await;
        eventually("transport closed", || f.transport.is_closed()).await;
    }
}
