//! # Sample Rate Conversion
//!
//! Devices run at whatever rate the hardware mixer offers (commonly 44.1 or
//! 48 kHz) while the session streams 24 kHz. [`StreamResampler`] converts a
//! continuous mono stream delivered in arbitrarily sized blocks.
//!
//! ## How it works:
//! - Input is buffered until a full chunk is available (rubato may round the
//!   requested chunk size up to fit the rate ratio)
//! - Each full chunk goes through an FFT resampler (`rubato::FftFixedIn`)
//! - Leftover input waits for the next call, so no samples are padded or lost
//! - Equal rates skip rubato entirely and copy the input through

use crate::error::CaptureError;
use rubato::{FftFixedIn, Resampler};
use tracing::warn;

/// Requested input frames per resampler call.
const CHUNK: usize = 1024;
const SUB_CHUNKS: usize = 2;

pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// ## Parameters:
    /// - **from_rate**: rate of the samples passed to [`process`](Self::process)
    /// - **to_rate**: rate of the samples it produces
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, CaptureError> {
        if from_rate == 0 || to_rate == 0 {
            return Err(CaptureError::InvalidFormat(format!(
                "cannot resample {} Hz to {} Hz",
                from_rate, to_rate
            )));
        }

        let inner = if from_rate == to_rate {
            None
        } else {
            let resampler = FftFixedIn::<f32>::new(
                from_rate as usize,
                to_rate as usize,
                CHUNK,
                SUB_CHUNKS,
                1,
            )
            .map_err(|e| {
                CaptureError::InvalidFormat(format!(
                    "cannot resample {} Hz to {} Hz: {}",
                    from_rate, to_rate, e
                ))
            })?;
            Some(resampler)
        };

        Ok(Self {
            inner,
            pending: Vec::with_capacity(CHUNK * 2),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Input samples needed before the next block of output appears.
    pub fn chunk_len(&self) -> usize {
        self.inner.as_ref().map_or(1, |r| r.input_frames_next())
    }

    /// Convert `input`, replacing the contents of `out` with whatever output
    /// is ready. `out` may be left empty while input is still buffering.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        out.clear();
        let Some(resampler) = self.inner.as_mut() else {
            out.extend_from_slice(input);
            return;
        };

        self.pending.extend_from_slice(input);
        let mut consumed = 0;
        let wanted = resampler.input_frames_next();
        while self.pending.len() - consumed >= wanted {
            let chunk = &self.pending[consumed..consumed + wanted];
            match resampler.process(&[chunk], None) {
                Ok(mut channels) => {
                    if let Some(mono) = channels.pop() {
                        out.extend_from_slice(&mono);
                    }
                }
                Err(e) => warn!("Dropping audio block that failed to resample: {}", e),
            }
            consumed += wanted;
        }
        self.pending.drain(..consumed);
    }

    /// Forget buffered input and the resampler's history.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.inner.as_mut() {
            resampler.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_equal_rates_pass_through() {
        let mut resampler = StreamResampler::new(24000, 24000).unwrap();
        assert!(resampler.is_passthrough());

        let mut out = Vec::new();
        resampler.process(&[0.1, 0.2, 0.3], &mut out);
        assert_eq!(out, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_downsamples_48k_to_24k() {
        let mut resampler = StreamResampler::new(48000, 24000).unwrap();
        assert!(!resampler.is_passthrough());
        let chunk = resampler.chunk_len();

        let input = sine(48000, 4 * chunk);
        let mut total = 0;
        let mut out = Vec::new();
        // Odd block sizes, as a device callback would deliver them
        for block in input.chunks(700) {
            resampler.process(block, &mut out);
            total += out.len();
        }

        // Halving the rate halves every full chunk
        assert_eq!(total, 2 * chunk);
    }

    #[test]
    fn test_partial_chunk_waits_for_more_input() {
        let mut resampler = StreamResampler::new(44100, 24000).unwrap();
        let chunk = resampler.chunk_len();
        let mut out = Vec::new();

        resampler.process(&vec![0.0; chunk - 1], &mut out);
        assert!(out.is_empty());

        resampler.process(&[0.0], &mut out);
        assert!(!out.is_empty());
    }

    #[test]
    fn test_reset_drops_pending_input() {
        let mut resampler = StreamResampler::new(48000, 24000).unwrap();
        let chunk = resampler.chunk_len();
        let mut out = Vec::new();

        resampler.process(&vec![0.0; chunk - 1], &mut out);
        resampler.reset();
        resampler.process(&[0.0], &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_zero_rate_is_rejected() {
        assert!(matches!(
            StreamResampler::new(0, 24000),
            Err(CaptureError::InvalidFormat(_))
        ));
    }
}
