//! # Microphone Capture
//!
//! Turns a device's arbitrarily sized sample callbacks into fixed-size mono
//! [`AudioFrame`]s and lets the session pause and resume the flow without
//! tearing down the device.
//!
//! ## Key Rust Concepts:
//! - **Trait objects**: [`MicrophoneBackend`] hides whether samples come from cpal or a test double
//! - **RAII**: an [`InputStream`] owns the device; dropping or closing it releases the microphone
//! - **Atomics**: [`PauseSwitch`] and [`LevelMeter`] are shared with the real-time callback
//!   without locks, so the callback never blocks
//!
//! ## Pausing:
//! While paused, incoming samples are ignored and any partially filled frame
//! is thrown away. No silence is padded in, so resuming starts a fresh frame.

use crate::error::CaptureError;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A fixed-length block of normalized mono samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Root mean square of `samples`
    pub level: f32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        let level = rms(&samples);
        Self {
            samples,
            sample_rate,
            channels: 1,
            level,
        }
    }
}

/// Root mean square loudness, computed in place.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Format the capture pipeline asks the device for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub frame_size: usize,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            frame_size: 4096,
        }
    }
}

/// Shared on/off switch for the capture flow.
#[derive(Debug, Clone, Default)]
pub struct PauseSwitch(Arc<AtomicBool>);

impl PauseSwitch {
    pub fn new(paused: bool) -> Self {
        Self(Arc::new(AtomicBool::new(paused)))
    }

    pub fn set(&self, paused: bool) {
        self.0.store(paused, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.set(true);
    }

    pub fn resume(&self) {
        self.set(false);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Most recent frame loudness, readable from any thread.
#[derive(Debug, Clone, Default)]
pub struct LevelMeter(Arc<AtomicU32>);

impl LevelMeter {
    pub fn store(&self, level: f32) {
        self.0.store(level.to_bits(), Ordering::Relaxed);
    }

    pub fn level(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Receives mono samples from the device callback.
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// An open microphone stream. Closing must be idempotent, and implementations
/// are expected to close on drop as well.
pub trait InputStream: Send {
    fn close(&mut self);
}

/// Something that can open a microphone.
pub trait MicrophoneBackend: Send + Sync {
    /// Acquire the device exclusively and start feeding mono samples at
    /// `format.sample_rate` into `sink`.
    fn open(
        &self,
        format: &CaptureFormat,
        sink: SampleSink,
    ) -> Result<Box<dyn InputStream>, CaptureError>;
}

/// Re-chunks device samples into fixed frames.
struct Framer {
    frame: Vec<f32>,
    format: CaptureFormat,
    pause: PauseSwitch,
    level: LevelMeter,
    emit: Arc<dyn Fn(AudioFrame) + Send + Sync>,
}

impl Framer {
    fn push(&mut self, mut samples: &[f32]) {
        if self.pause.is_paused() {
            self.frame.clear();
            return;
        }

        while !samples.is_empty() {
            let wanted = self.format.frame_size - self.frame.len();
            let take = wanted.min(samples.len());
            self.frame.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.frame.len() == self.format.frame_size {
                let full = std::mem::replace(
                    &mut self.frame,
                    Vec::with_capacity(self.format.frame_size),
                );
                let frame = AudioFrame::new(full, self.format.sample_rate);
                self.level.store(frame.level);
                (self.emit)(frame);
            }
        }
    }
}

/// Microphone capture with pause/resume.
pub struct AudioCapture {
    backend: Arc<dyn MicrophoneBackend>,
    format: CaptureFormat,
    pause: PauseSwitch,
    level: LevelMeter,
    on_frame: Arc<dyn Fn(AudioFrame) + Send + Sync>,
    stream: Option<Box<dyn InputStream>>,
}

impl AudioCapture {
    /// ## Parameters:
    /// - **backend**: device provider
    /// - **format**: sample rate and frame size
    /// - **on_frame**: called from the audio thread once per full frame; must not block
    pub fn new<F>(backend: Arc<dyn MicrophoneBackend>, format: CaptureFormat, on_frame: F) -> Self
    where
        F: Fn(AudioFrame) + Send + Sync + 'static,
    {
        Self {
            backend,
            format,
            pause: PauseSwitch::new(true),
            level: LevelMeter::default(),
            on_frame: Arc::new(on_frame),
            stream: None,
        }
    }

    /// Acquire the microphone. Calling `start` on a running capture is a no-op.
    ///
    /// Fails with `InvalidFormat` before touching the device if the frame size
    /// or sample rate is zero.
    pub fn start(&mut self, initially_paused: bool) -> Result<(), CaptureError> {
        if self.stream.is_some() {
            return Ok(());
        }
        if self.format.frame_size == 0 {
            return Err(CaptureError::InvalidFormat("frame size must be at least 1".to_string()));
        }
        if self.format.sample_rate == 0 {
            return Err(CaptureError::InvalidFormat("sample rate must be greater than 0".to_string()));
        }

        self.pause.set(initially_paused);
        let mut framer = Framer {
            frame: Vec::with_capacity(self.format.frame_size),
            format: self.format.clone(),
            pause: self.pause.clone(),
            level: self.level.clone(),
            emit: Arc::clone(&self.on_frame),
        };
        let sink: SampleSink = Box::new(move |samples| framer.push(samples));

        let stream = self.backend.open(&self.format, sink)?;
        self.stream = Some(stream);
        info!(
            sample_rate = self.format.sample_rate,
            frame_size = self.format.frame_size,
            paused = initially_paused,
            "Microphone capture started"
        );
        Ok(())
    }

    pub fn pause(&self) {
        self.pause.pause();
    }

    pub fn resume(&self) {
        self.pause.resume();
    }

    /// Release the device. Safe to call any number of times.
    pub fn stop(&mut self) {
        self.pause.pause();
        if let Some(mut stream) = self.stream.take() {
            stream.close();
            debug!("Microphone released");
        }
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    pub fn pause_switch(&self) -> PauseSwitch {
        self.pause.clone()
    }

    pub fn level_meter(&self) -> LevelMeter {
        self.level.clone()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockMicrophone;
    use super::*;
    use std::sync::Mutex;

    fn capture_with(mic: Arc<MockMicrophone>, frame_size: usize) -> (AudioCapture, Arc<Mutex<Vec<AudioFrame>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        let format = CaptureFormat {
            sample_rate: 24000,
            frame_size,
        };
        let capture = AudioCapture::new(mic, format, move |frame| sink.lock().unwrap().push(frame));
        (capture, frames)
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_frames_are_fixed_size() {
        let mic = Arc::new(MockMicrophone::default());
        let (mut capture, frames) = capture_with(Arc::clone(&mic), 4);
        capture.start(false).unwrap();

        mic.feed(&[0.1, 0.2, 0.3]);
        assert!(frames.lock().unwrap().is_empty());
        mic.feed(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(frames[1].samples, vec![0.5, 0.6, 0.7, 0.8]);
        assert_eq!(frames[0].channels, 1);
    }

    #[test]
    fn test_pause_discards_partial_frame() {
        let mic = Arc::new(MockMicrophone::default());
        let (mut capture, frames) = capture_with(Arc::clone(&mic), 4);
        capture.start(false).unwrap();

        mic.feed(&[0.1, 0.2]);
        capture.pause();
        mic.feed(&[0.3, 0.4, 0.5, 0.6]);
        assert!(frames.lock().unwrap().is_empty());

        capture.resume();
        mic.feed(&[0.7, 0.7, 0.7, 0.7]);
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples, vec![0.7; 4]);
    }

    #[test]
    fn test_start_paused_emits_nothing() {
        let mic = Arc::new(MockMicrophone::default());
        let (mut capture, frames) = capture_with(Arc::clone(&mic), 2);
        capture.start(true).unwrap();
        mic.feed(&[0.5; 8]);
        assert!(frames.lock().unwrap().is_empty());
        assert!(capture.is_paused());
    }

    #[test]
    fn test_zero_frame_size_is_rejected_before_opening() {
        let mic = Arc::new(MockMicrophone::default());
        let (mut capture, _frames) = capture_with(Arc::clone(&mic), 0);

        assert!(matches!(capture.start(false), Err(CaptureError::InvalidFormat(_))));
        assert_eq!(mic.opens.load(Ordering::SeqCst), 0);
        assert_eq!(mic.acquired(), 0);
        assert!(!capture.is_running());
    }

    #[test]
    fn test_level_meter_tracks_last_frame() {
        let mic = Arc::new(MockMicrophone::default());
        let (mut capture, _frames) = capture_with(Arc::clone(&mic), 2);
        let meter = capture.level_meter();
        capture.start(false).unwrap();
        mic.feed(&[0.25, -0.25]);
        assert!((meter.level() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mic = Arc::new(MockMicrophone::default());
        let (mut capture, _frames) = capture_with(Arc::clone(&mic), 4);
        capture.start(false).unwrap();
        assert_eq!(mic.acquired(), 1);

        capture.stop();
        capture.stop();
        assert_eq!(mic.acquired(), 0);
        assert!(!capture.is_running());
    }

    #[test]
    fn test_start_twice_acquires_once() {
        let mic = Arc::new(MockMicrophone::default());
        let (mut capture, _frames) = capture_with(Arc::clone(&mic), 4);
        capture.start(false).unwrap();
        capture.start(false).unwrap();
        assert_eq!(mic.opens.load(Ordering::SeqCst), 1);
        drop(capture);
        assert_eq!(mic.acquired(), 0);
    }

    #[test]
    fn test_permission_denied_surfaces() {
        let mic = Arc::new(MockMicrophone::failing(CaptureError::PermissionDenied));
        let (mut capture, _frames) = capture_with(Arc::clone(&mic), 4);
        assert_eq!(capture.start(false), Err(CaptureError::PermissionDenied));
        assert!(!capture.is_running());
        assert_eq!(mic.acquired(), 0);
    }
}
