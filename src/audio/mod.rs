//! # Audio Pipeline
//!
//! Everything between the microphone and the control channel, and between
//! the control channel and the speaker.
//!
//! ## Module Structure:
//! - **capture**: Fixed-size frame capture with pause/resume
//! - **codec**: PCM16 + base64 encoding and decoding
//! - **queue**: Bounded, non-blocking hand-off from the audio thread to the session loop
//! - **playback**: Buffered output of assistant audio
//! - **resample**: Conversion between device rates and the session rate
//! - **cpal_backend**: Real devices through cpal

pub mod capture;
pub mod codec;
pub mod cpal_backend;
pub mod playback;
pub mod queue;
pub mod resample;

pub use capture::{AudioCapture, AudioFrame, CaptureFormat, LevelMeter, MicrophoneBackend, PauseSwitch};
pub use codec::{EncodedAudioChunk, PlayableAudioBuffer};
pub use cpal_backend::{list_devices, AudioDevices, CpalMicrophone, CpalSpeaker};
pub use playback::{AudioSink, PlaybackBuffer};
pub use queue::{frame_queue, FrameReceiver, FrameSender};
pub use resample::StreamResampler;
