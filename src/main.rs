//! # Realtime Voice - Command Line Client
//!
//! Runs one voice conversation from the terminal: the microphone streams to the
//! realtime model, the assistant's audio plays through the speakers and both
//! sides' transcripts are logged.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The session, the console reader and the signal handlers all run on tokio
//! - **Arc<dyn Trait>**: The engine receives its credential provider, transport and devices as trait objects
//! - **static**: A global shutdown flag set by the signal handlers
//!
//! ## Console Commands:
//! - any text: send it as a typed message
//! - `/mute`, `/unmute`: toggle the microphone
//! - `/commit`: end the current spoken turn manually
//! - `/cancel`: interrupt the assistant
//! - `/level`: show the current microphone level
//! - `/quit`: end the session
//!
//! ## Flags:
//! - `--print-config`: print the effective configuration as TOML and exit
//! - `--list-devices`: print the audio device names usable in `audio.input_device` / `audio.output_device`

use anyhow::Result;
use async_trait::async_trait;
use realtime_voice_engine::audio::{list_devices, AudioSink, CpalMicrophone, CpalSpeaker};
use realtime_voice_engine::config::{AppConfig, TransportKind};
use realtime_voice_engine::protocol::ServerEvent;
use realtime_voice_engine::session::{
    ConversationMessage, EngineOptions, SessionEngine, SessionNotice, SessionObserver,
    TranscriptSink,
};
use realtime_voice_engine::signaling::{
    Connector, HttpCredentialProvider, SignalingClient, WebRtcConnector, WebSocketConnector,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by SIGTERM/SIGINT or the `/quit` command.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from `config.toml`, `.env` and environment variables
/// 2. **Sets up logging**
/// 3. **Builds the engine** with the configured transport and audio devices
/// 4. **Connects** and runs the console loop until shutdown
/// 5. **Disconnects**, releasing the microphone and the transport
#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    if std::env::args().any(|arg| arg == "--print-config") {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    if std::env::args().any(|arg| arg == "--list-devices") {
        print_devices()?;
        return Ok(());
    }

    info!("Starting realtime-voice v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: model={} voice={} transport={:?}",
        config.realtime.model, config.realtime.voice, config.endpoints.transport
    );

    let engine = build_engine(&config)?;

    setup_signal_handlers();

    let handle = match engine.connect(config.session_config()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to connect: {}", e);
            eprintln!("{}", e.user_message());
            return Ok(());
        }
    };
    println!("Connected. Speak, or type a message. /mute /unmute /commit /cancel /level /quit");

    // Log every connection state change, and stop when the session ends on its own
    let mut states = WatchStream::new(handle.subscribe_state());
    let state_task = tokio::spawn(async move {
        while let Some(state) = states.next().await {
            debug!("Connection state: {}", state.as_str());
            if state.is_terminal() {
                SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read console input: {}", e);
                        break;
                    }
                };
                let result = match line.trim() {
                    "/quit" => break,
                    "/mute" => handle.set_muted(true).await.map(|turn| println!("Microphone muted ({})", turn.as_str())),
                    "/unmute" => handle.set_muted(false).await.map(|turn| println!("Microphone live ({})", turn.as_str())),
                    "/commit" => handle.commit_audio().await,
                    "/cancel" => handle.cancel_response().await,
                    "/level" => {
                        println!("Microphone level: {:.3}", handle.audio_level());
                        Ok(())
                    }
                    "" => Ok(()),
                    text => handle.send_text(text).await,
                };
                if let Err(e) = result {
                    warn!("Command failed: {}", e);
                }
            }
            _ = wait_for_shutdown() => {
                info!("Shutdown signal received, ending session...");
                break;
            }
        }
    }

    handle.disconnect().await;
    state_task.abort();
    info!(metrics = ?handle.metrics(), "Session finished");
    Ok(())
}

/// Wire the engine to the configured services and audio devices.
fn build_engine(config: &AppConfig) -> Result<SessionEngine> {
    let credentials = HttpCredentialProvider::new(
        config.endpoints.token_url.clone(),
        config.token_api_key(),
        config.request_timeout(),
    )?;

    let connector: Arc<dyn Connector> = match config.endpoints.transport {
        TransportKind::WebRtc => {
            let signaling = SignalingClient::new(
                config.endpoints.negotiation_url.clone(),
                config.realtime.model.clone(),
                config.request_timeout(),
            )?;
            Arc::new(WebRtcConnector::new(signaling, config.endpoints.stun_server.clone()))
        }
        TransportKind::WebSocket => {
            Arc::new(WebSocketConnector::new(config.endpoints.websocket_url.clone()))
        }
    };

    let mut engine = SessionEngine::new(
        Arc::new(credentials),
        connector,
        Arc::new(CpalMicrophone::new(config.audio.input_device())),
    )
    .with_observer(Arc::new(ConsoleObserver))
    .with_transcript_sink(Arc::new(LogTranscriptSink))
    .with_options(EngineOptions {
        connect_timeout: config.connect_timeout(),
        frame_size: config.audio.frame_size,
        frame_queue_capacity: config.audio.queue_capacity,
        ..Default::default()
    });

    if config.audio.playback_enabled {
        let speaker = CpalSpeaker::open(
            config.audio.output_device(),
            config.audio.sample_rate,
            config.audio.playback_buffer_secs,
        );
        match speaker {
            Ok(speaker) => engine = engine.with_speaker(Arc::new(speaker) as Arc<dyn AudioSink>),
            Err(e) => warn!("Playback disabled: {}", e),
        }
    }

    Ok(engine)
}

/// Print input and output device names, marking the host defaults.
fn print_devices() -> Result<()> {
    let devices = list_devices()?;
    let mark = |name: &String, default: &Option<String>| {
        if default.as_ref() == Some(name) { " (default)" } else { "" }
    };

    println!("Input devices:");
    for name in &devices.inputs {
        println!("  {}{}", name, mark(name, &devices.default_input));
    }
    println!("Output devices:");
    for name in &devices.outputs {
        println!("  {}{}", name, mark(name, &devices.default_output));
    }
    Ok(())
}

/// Prints transcripts and notices to the console.
struct ConsoleObserver;

impl SessionObserver for ConsoleObserver {
    fn on_event(&self, event: &ServerEvent) {
        if let ServerEvent::SessionCreated { .. } = event {
            info!("Remote session created");
        }
    }

    fn on_message(&self, message: &ConversationMessage) {
        println!("{:?}: {}", message.role, message.content);
    }

    fn on_notice(&self, notice: &SessionNotice) {
        match notice {
            SessionNotice::ServiceError(message) => eprintln!("Service error: {}", message),
            SessionNotice::SessionEnded { initiated_by_user: false, reason } => {
                eprintln!("Session ended: {}", reason)
            }
            SessionNotice::SessionEnded { .. } => println!("Session ended"),
        }
    }
}

/// Writes finished messages to the log as JSON.
struct LogTranscriptSink;

#[async_trait]
impl TranscriptSink for LogTranscriptSink {
    async fn persist(&self, message: ConversationMessage) -> Result<()> {
        info!(target: "transcript", "{}", serde_json::to_string(&message)?);
        Ok(())
    }
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "info", "realtime_voice_engine=trace")
/// - If not set, defaults to "realtime_voice_engine=debug,realtime_voice=info,webrtc=warn"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "realtime_voice_engine=debug,realtime_voice=info,transcript=info,webrtc=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

/// Set up signal handlers for graceful shutdown.
///
/// ## What this does:
/// - Listens for SIGTERM and SIGINT (Ctrl+C)
/// - Sets the global shutdown flag when either arrives
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown flag, polling every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
