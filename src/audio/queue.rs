//! Bounded hand-off from the real-time audio callback to the session loop.
//!
//! The callback side never waits: when the queue is full the newest frame is
//! dropped and `push` reports it, so the caller can count it.

use super::capture::AudioFrame;
use tokio::sync::mpsc;

/// Create a queue that holds at most `capacity` frames.
pub fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FrameSender { tx }, FrameReceiver { rx })
}

/// Producer half, owned by the capture callback.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<AudioFrame>,
}

impl FrameSender {
    /// Enqueue without blocking. Returns `false` if the frame was dropped.
    pub fn push(&self, frame: AudioFrame) -> bool {
        self.tx.try_send(frame).is_ok()
    }
}

/// Consumer half, owned by the session loop.
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::Receiver<AudioFrame>,
}

impl FrameReceiver {
    pub async fn recv(&mut self) -> Option<AudioFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AudioFrame> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting frames and discard anything still queued.
    pub fn close(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while self.try_recv().is_some() {
            discarded += 1;
        }
        discarded
    }
}
