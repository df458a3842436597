//! # Configuration Management
//!
//! This module loads the engine's configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP__ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Converts between the Rust structs below and TOML or environment values
//! - **derive macros**: Generate `Debug`, `Clone`, `Serialize` and `Deserialize` impls
//! - **impl blocks**: Add loading, validation and conversion methods to the struct
//! - **Result<T, E>**: Loading and validation return `anyhow::Result` so callers can use `?`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `REALTIME_TOKEN_URL` / `REALTIME_MODEL` special variables
//! 2. Environment variables (APP__REALTIME__VOICE, APP__AUDIO__SAMPLE_RATE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::protocol::{Modality, TurnDetection};
use crate::session::SessionConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Default system instructions for the conversational voice.
pub const DEFAULT_INSTRUCTIONS: &str = "You are NewMe, a warm and supportive companion. \
Speak naturally and concisely, ask one question at a time, and listen closely to what the \
user shares. Encourage reflection and celebrate small wins.";

/// Main configuration for the voice engine and its command line client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub realtime: RealtimeConfig,
    pub endpoints: EndpointsConfig,
    pub audio: AudioConfig,
    pub session: SessionSettings,
}

/// What the remote conversational model should be and how it should behave.
///
/// ## Fields:
/// - `model`: Realtime model identifier sent to the token and negotiation endpoints
/// - `voice`: Voice used for spoken responses (e.g. "alloy", "verse")
/// - `modalities`: Output modalities, any of "audio" and "text"
/// - `greeting`: Instructions for a scripted opening response; empty disables it
/// - `memory_context`: Summary of earlier conversations appended to the instructions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub model: String,
    pub voice: String,
    pub modalities: Vec<Modality>,
    pub instructions: String,
    pub greeting: String,
    pub memory_context: String,
    pub temperature: f32,
    pub transcription_model: String,
}

/// Which transport carries the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Peer connection with an `oai-events` data channel
    WebRtc,
    /// Plain WebSocket, used where peer connections are unavailable
    WebSocket,
}

/// External service locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    pub token_url: String,
    /// Optional bearer key for the token service; empty means none
    pub token_api_key: String,
    pub negotiation_url: String,
    pub websocket_url: String,
    pub transport: TransportKind,
    pub stun_server: String,
}

/// Capture and playback tuning.
///
/// ## Tuning guidelines:
/// - `frame_size` 4096 at 24kHz is about 170ms per outbound chunk
/// - `queue_capacity` bounds how many frames may wait for the session loop before new ones are dropped
/// - `input_device`/`output_device` take exact names from `--list-devices`; empty means the system default
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_device: String,
    pub output_device: String,
    pub sample_rate: u32,
    pub frame_size: usize,
    pub queue_capacity: usize,
    pub start_muted: bool,
    pub playback_enabled: bool,
    pub playback_buffer_secs: u32,
}

impl AudioConfig {
    pub fn input_device(&self) -> Option<String> {
        non_empty(&self.input_device)
    }

    pub fn output_device(&self) -> Option<String> {
        non_empty(&self.output_device)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Upper bound on the whole connect sequence
    pub connect_timeout_ms: u64,
    /// Per-request timeout for token and negotiation HTTP calls
    pub request_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            realtime: RealtimeConfig {
                model: "gpt-4o-realtime-preview-2024-12-17".to_string(),
                voice: "alloy".to_string(),
                modalities: vec![Modality::Text, Modality::Audio],
                instructions: DEFAULT_INSTRUCTIONS.to_string(),
                greeting: String::new(),
                memory_context: String::new(),
                temperature: 0.8,
                transcription_model: "whisper-1".to_string(),
            },
            endpoints: EndpointsConfig {
                token_url: "http://127.0.0.1:54321/functions/v1/realtime-token".to_string(),
                token_api_key: String::new(),
                negotiation_url: "https://api.openai.com/v1/realtime".to_string(),
                websocket_url: "wss://api.openai.com/v1/realtime".to_string(),
                transport: TransportKind::WebRtc,
                stun_server: "stun:stun.l.google.com:19302".to_string(),
            },
            audio: AudioConfig {
                input_device: String::new(),
                output_device: String::new(),
                sample_rate: 24000,     // PCM16 at 24kHz is what the realtime API expects
                frame_size: 4096,
                queue_capacity: 32,
                start_muted: false,
                playback_enabled: true,
                playback_buffer_secs: 30,
            },
            session: SessionSettings {
                connect_timeout_ms: 15_000,
                request_timeout_ms: 10_000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__REALTIME__VOICE=verse`: Override the voice
    /// - `APP__ENDPOINTS__TRANSPORT=websocket`: Use the WebSocket transport
    /// - `APP__AUDIO__START_MUTED=true`: Join the session muted
    /// - `REALTIME_TOKEN_URL=https://...`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = ::config::Config::builder()
            .add_source(::config::Config::try_from(&AppConfig::default())?)
            .add_source(::config::File::with_name("config").required(false))
            .add_source(::config::Environment::with_prefix("APP").separator("__"));

        if let Ok(url) = env::var("REALTIME_TOKEN_URL") {
            settings = settings.set_override("endpoints.token_url", url)?;
        }

        if let Ok(model) = env::var("REALTIME_MODEL") {
            settings = settings.set_override("realtime.model", model)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.realtime.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Realtime model cannot be empty"));
        }

        if self.realtime.modalities.is_empty() {
            return Err(anyhow::anyhow!("At least one modality must be enabled"));
        }

        if !(0.0..=2.0).contains(&self.realtime.temperature) {
            return Err(anyhow::anyhow!("Temperature must be between 0.0 and 2.0"));
        }

        if self.endpoints.token_url.trim().is_empty() {
            return Err(anyhow::anyhow!("Token URL cannot be empty"));
        }

        if !self.endpoints.negotiation_url.starts_with("http") {
            return Err(anyhow::anyhow!("Negotiation URL must be an http(s) URL"));
        }

        if !self.endpoints.websocket_url.starts_with("ws") {
            return Err(anyhow::anyhow!("WebSocket URL must be a ws(s) URL"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Frame size must be greater than 0"));
        }

        if self.audio.queue_capacity == 0 {
            return Err(anyhow::anyhow!("Frame queue capacity must be greater than 0"));
        }

        if self.session.connect_timeout_ms == 0 || self.session.request_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Timeouts must be greater than 0"));
        }

        Ok(())
    }

    /// Build the per-session configuration the engine negotiates with.
    pub fn session_config(&self) -> SessionConfig {
        let realtime = &self.realtime;
        SessionConfig {
            model: realtime.model.clone(),
            voice: realtime.voice.clone(),
            modalities: realtime.modalities.clone(),
            instructions: realtime.instructions.clone(),
            memory_context: non_empty(&realtime.memory_context),
            greeting: non_empty(&realtime.greeting),
            temperature: realtime.temperature,
            transcription_model: non_empty(&realtime.transcription_model),
            turn_detection: TurnDetection::default(),
            sample_rate: self.audio.sample_rate,
            start_muted: self.audio.start_muted,
        }
    }

    pub fn token_api_key(&self) -> Option<String> {
        non_empty(&self.endpoints.token_api_key)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.session.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.session.request_timeout_ms)
    }

    /// Render the effective configuration as TOML, with secrets blanked.
    pub fn to_toml(&self) -> Result<String> {
        let mut redacted = self.clone();
        if !redacted.endpoints.token_api_key.is_empty() {
            redacted.endpoints.token_api_key = "<redacted>".to_string();
        }
        Ok(toml::to_string_pretty(&redacted)?)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
