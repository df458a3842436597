//! # Assistant Audio Playback
//!
//! Decoded assistant audio is queued in a bounded [`PlaybackBuffer`] and
//! drained by the output device in whatever block size it asks for.
//!
//! ## Thread Safety:
//! `Arc<Mutex<VecDeque<f32>>>` lets the session loop append while the device
//! callback drains. The lock is held only for a copy, never across I/O.
//!
//! ## Memory Management:
//! When the buffer is full the oldest samples are discarded, so a stalled
//! device never makes the queue grow without bound.

use super::codec::PlayableAudioBuffer;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Where decoded assistant audio goes.
pub trait AudioSink: Send + Sync {
    /// Queue audio for sequential playback.
    fn play(&self, audio: PlayableAudioBuffer);

    /// Drop anything not yet played.
    fn clear(&self) {}
}

/// Bounded FIFO of mono samples shared with an output callback.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    buffer: Arc<Mutex<VecDeque<f32>>>,
    sample_rate: u32,
    max_samples: usize,
}

impl PlaybackBuffer {
    /// ## Calculations:
    /// - **max_samples**: max_seconds * sample_rate
    pub fn new(sample_rate: u32, max_seconds: u32) -> Self {
        let max_samples = (sample_rate as usize * max_seconds as usize).max(1);
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(sample_rate as usize))),
            sample_rate,
            max_samples,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<f32>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append samples, discarding the oldest ones beyond capacity.
    pub fn append(&self, samples: &[f32]) {
        let mut buffer = self.lock();
        buffer.extend(samples.iter().copied());
        let excess = buffer.len().saturating_sub(self.max_samples);
        if excess > 0 {
            buffer.drain(..excess);
        }
    }

    /// Fill `out` with queued samples, padding with silence.
    ///
    /// ## Returns:
    /// Number of real samples written before the silence.
    pub fn fill(&self, out: &mut [f32]) -> usize {
        let mut buffer = self.lock();
        let available = buffer.len().min(out.len());
        for (slot, sample) in out.iter_mut().zip(buffer.drain(..available)) {
            *slot = sample;
        }
        for slot in &mut out[available..] {
            *slot = 0.0;
        }
        available
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        self.len() as f64 / self.sample_rate as f64
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl AudioSink for PlaybackBuffer {
    fn play(&self, audio: PlayableAudioBuffer) {
        self.append(&audio.samples);
    }

    fn clear(&self) {
        PlaybackBuffer::clear(self);
    }
}
