//! # cpal Device Backend
//!
//! Real microphone and speaker access through cpal.
//!
//! ## Threading:
//! cpal streams are not `Send`, so each stream lives on its own thread. The
//! thread reports whether the stream opened over a sync channel, then parks
//! until it is told to shut down. Closing joins the thread, so once `close`
//! returns no device callback can fire.
//!
//! ## Sample Rates:
//! Devices are opened at the session rate when they support it, otherwise at
//! their native rate (48 kHz when available). A [`StreamResampler`] converts
//! between the two in each direction.

use super::capture::{CaptureFormat, InputStream, MicrophoneBackend, SampleSink};
use super::codec::PlayableAudioBuffer;
use super::playback::{AudioSink, PlaybackBuffer};
use super::resample::StreamResampler;
use crate::error::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, SampleFormat, StreamConfig, SupportedStreamConfig};
use std::sync::{mpsc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Rate tried when a device cannot run at the session rate.
const PREFERRED_NATIVE_RATE: u32 = 48_000;

/// Microphone backed by the default cpal host.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    /// Exact device name to open; `None` uses the system default
    pub device_name: Option<String>,
}

impl CpalMicrophone {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

/// Speaker backed by the default cpal host.
///
/// Audio arrives at the session rate and is resampled to the device rate
/// before it is queued in the [`PlaybackBuffer`] the device drains.
pub struct CpalSpeaker {
    buffer: PlaybackBuffer,
    session_rate: u32,
    resampler: Mutex<StreamResampler>,
    stream: DeviceThread,
}

/// Names of the audio devices the default host exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioDevices {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub default_input: Option<String>,
    pub default_output: Option<String>,
}

/// Enumerate input and output devices on the default host.
pub fn list_devices() -> Result<AudioDevices, CaptureError> {
    let host = cpal::default_host();
    let names = |devices: Vec<Device>| -> Vec<String> {
        devices.into_iter().filter_map(|d| d.name().ok()).collect()
    };

    let inputs = host
        .input_devices()
        .map_err(|e| map_device_error(e.to_string()))?
        .collect();
    let outputs = host
        .output_devices()
        .map_err(|e| map_device_error(e.to_string()))?
        .collect();

    Ok(AudioDevices {
        inputs: names(inputs),
        outputs: names(outputs),
        default_input: host.default_input_device().and_then(|d| d.name().ok()),
        default_output: host.default_output_device().and_then(|d| d.name().ok()),
    })
}

/// Handle to the thread that owns a cpal stream.
struct DeviceThread {
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceThread {
    /// Spawn `build` on a dedicated thread and wait until it reports whether
    /// the stream started. `build` may hand back a value describing the
    /// opened stream.
    fn spawn<F, T>(name: &str, build: F) -> Result<(Self, T), CaptureError>
    where
        F: FnOnce() -> Result<(cpal::Stream, T), CaptureError> + Send + 'static,
        T: Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let (stream, opened) = match build() {
                    Ok(built) => built,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(CaptureError::Stream(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(opened));

                // Blocks until close() sends or drops the sender
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(|e| CaptureError::Stream(format!("failed to spawn audio thread: {}", e)))?;

        let mut handle = Self {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        };

        match ready_rx.recv() {
            Ok(Ok(opened)) => Ok((handle, opened)),
            Ok(Err(e)) => {
                handle.close();
                Err(e)
            }
            Err(_) => {
                handle.close();
                Err(CaptureError::Stream("audio thread exited before starting".to_string()))
            }
        }
    }

    fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Audio device thread panicked");
            }
        }
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        self.close();
    }
}

impl InputStream for DeviceThread {
    fn close(&mut self) {
        DeviceThread::close(self);
    }
}

impl MicrophoneBackend for CpalMicrophone {
    fn open(
        &self,
        format: &CaptureFormat,
        mut sink: SampleSink,
    ) -> Result<Box<dyn InputStream>, CaptureError> {
        let device_name = self.device_name.clone();
        let session_rate = format.sample_rate;

        let (thread, ()) = DeviceThread::spawn("mic-capture", move || {
            let host = cpal::default_host();
            let device = find_device(
                host.input_devices().map_err(|e| map_device_error(e.to_string()))?,
                host.default_input_device(),
                device_name.as_deref(),
            )?;
            let supported = find_matching_config(
                device
                    .supported_input_configs()
                    .map_err(|e| map_device_error(e.to_string()))?,
                session_rate,
            )?;
            let config: StreamConfig = supported.config();
            let channels = config.channels as usize;
            let device_rate = config.sample_rate.0;
            let mut resampler = StreamResampler::new(device_rate, session_rate)?;
            info!(
                device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
                device_rate,
                session_rate,
                channels,
                resampling = !resampler.is_passthrough(),
                resample_chunk = resampler.chunk_len(),
                "Opening microphone"
            );

            let on_error = |err: cpal::StreamError| warn!("Microphone stream error: {}", err);
            let mut mono: Vec<f32> = Vec::with_capacity(4096);
            let mut resampled: Vec<f32> = Vec::with_capacity(4096);
            let mut deliver = move |mono: &[f32]| {
                resampler.process(mono, &mut resampled);
                if !resampled.is_empty() {
                    sink(&resampled);
                }
            };

            let stream = match supported.sample_format() {
                SampleFormat::F32 => device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        downmix(data.iter().copied(), channels, &mut mono);
                        deliver(&mono);
                    },
                    on_error,
                    None,
                ),
                SampleFormat::I16 => device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        downmix(data.iter().map(|&s| s as f32 / 32768.0), channels, &mut mono);
                        deliver(&mono);
                    },
                    on_error,
                    None,
                ),
                other => {
                    return Err(CaptureError::DeviceUnavailable(format!(
                        "unsupported sample format {:?}",
                        other
                    )))
                }
            };
            Ok((stream.map_err(map_build_error)?, ()))
        })?;

        Ok(Box::new(thread))
    }
}

impl CpalSpeaker {
    /// Open the default (or named) output device.
    ///
    /// ## Parameters:
    /// - **device_name**: exact output device name; `None` uses the system default
    /// - **session_rate**: rate of the audio passed to [`AudioSink::play`]
    /// - **max_seconds**: how much unplayed audio to keep before dropping the oldest
    pub fn open(
        device_name: Option<String>,
        session_rate: u32,
        max_seconds: u32,
    ) -> Result<Self, CaptureError> {
        let (stream, buffer) = DeviceThread::spawn("speaker-playback", move || {
            let host = cpal::default_host();
            let device = find_device(
                host.output_devices().map_err(|e| map_device_error(e.to_string()))?,
                host.default_output_device(),
                device_name.as_deref(),
            )?;

            let supported = find_matching_config(
                device
                    .supported_output_configs()
                    .map_err(|e| map_device_error(e.to_string()))?
                    .filter(|c| c.sample_format() == SampleFormat::F32),
                session_rate,
            )?;
            let config: StreamConfig = supported.config();
            let channels = config.channels.max(1) as usize;
            let buffer = PlaybackBuffer::new(config.sample_rate.0, max_seconds);
            let source = buffer.clone();
            let mut mono: Vec<f32> = Vec::with_capacity(4096);

            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        mono.resize(data.len() / channels, 0.0);
                        source.fill(&mut mono);
                        for (frame, sample) in data.chunks_mut(channels).zip(mono.iter()) {
                            frame.fill(*sample);
                        }
                    },
                    |err| warn!("Speaker stream error: {}", err),
                    None,
                )
                .map_err(map_build_error)?;
            Ok((stream, buffer))
        })?;

        let resampler = StreamResampler::new(session_rate, buffer.sample_rate())?;
        debug!(
            session_rate,
            device_rate = buffer.sample_rate(),
            "Speaker playback started"
        );
        Ok(Self {
            buffer,
            session_rate,
            resampler: Mutex::new(resampler),
            stream,
        })
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        self.buffer.clear();
        self.stream.close();
    }
}

impl AudioSink for CpalSpeaker {
    fn play(&self, audio: PlayableAudioBuffer) {
        if audio.sample_rate != self.session_rate {
            warn!(
                expected = self.session_rate,
                got = audio.sample_rate,
                "Dropping audio with unexpected sample rate"
            );
            return;
        }
        if audio.is_empty() {
            return;
        }

        trace!(duration_ms = audio.duration().as_millis() as u64, "Queueing assistant audio");
        let mut resampled = Vec::with_capacity(audio.samples.len() * 2);
        self.resampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .process(&audio.samples, &mut resampled);
        self.buffer.append(&resampled);
    }

    fn clear(&self) {
        self.resampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        self.buffer.clear();
    }
}

/// The device named `name`, or `default` when no name is given.
fn find_device<I>(devices: I, default: Option<Device>, name: Option<&str>) -> Result<Device, CaptureError>
where
    I: Iterator<Item = Device>,
{
    match name {
        Some(name) => {
            let mut devices = devices;
            devices
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| CaptureError::DeviceUnavailable(format!("no device named \"{}\"", name)))
        }
        None => default.ok_or_else(|| CaptureError::DeviceUnavailable("no default device".to_string())),
    }
}

/// Pick a stream configuration, preferring ranges that contain `session_rate`,
/// then fewer channels, then f32 samples.
///
/// When no range contains `session_rate` the device runs at its native rate:
/// 48 kHz if the range allows it, otherwise the range's maximum.
fn find_matching_config<I>(configs: I, session_rate: u32) -> Result<SupportedStreamConfig, CaptureError>
where
    I: Iterator<Item = cpal::SupportedStreamConfigRange>,
{
    let supports = |c: &cpal::SupportedStreamConfigRange, rate: u32| {
        c.min_sample_rate().0 <= rate && c.max_sample_rate().0 >= rate
    };

    let mut candidates: Vec<_> = configs
        .filter(|c| matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16))
        .collect();
    candidates.sort_by_key(|c| {
        (
            !supports(c, session_rate),
            c.channels(),
            c.sample_format() != SampleFormat::F32,
        )
    });

    let best = candidates.into_iter().next().ok_or_else(|| {
        CaptureError::DeviceUnavailable("device offers no f32 or i16 stream format".to_string())
    })?;
    let rate = if supports(&best, session_rate) {
        session_rate
    } else if supports(&best, PREFERRED_NATIVE_RATE) {
        PREFERRED_NATIVE_RATE
    } else {
        best.max_sample_rate().0
    };
    Ok(best.with_sample_rate(cpal::SampleRate(rate)))
}

/// Average interleaved channels into `out`, reusing its allocation.
fn downmix<I>(samples: I, channels: usize, out: &mut Vec<f32>)
where
    I: Iterator<Item = f32>,
{
    out.clear();
    if channels <= 1 {
        out.extend(samples);
        return;
    }
    let mut acc = 0.0;
    let mut n = 0;
    for sample in samples {
        acc += sample;
        n += 1;
        if n == channels {
            out.push(acc / channels as f32);
            acc = 0.0;
            n = 0;
        }
    }
}

fn map_build_error(err: BuildStreamError) -> CaptureError {
    match err {
        BuildStreamError::DeviceNotAvailable => {
            CaptureError::DeviceUnavailable("device not available".to_string())
        }
        BuildStreamError::StreamConfigNotSupported => {
            CaptureError::DeviceUnavailable("stream configuration not supported".to_string())
        }
        other => map_device_error(other.to_string()),
    }
}

/// Hosts report permission problems as backend-specific text.
fn map_device_error(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        CaptureError::PermissionDenied
    } else {
        CaptureError::DeviceUnavailable(message)
    }
}
