//! Forwarding thread: capture queue to encoder.
//!
//! This is the only place encoder frame numbers are assigned. A number is
//! consumed only when the encoder accepts the frame, so the encoder sees a
//! gap-free sequence no matter how many frames are dropped on the way.

use retrace_capture::FrameStream;
use retrace_core::limits::{DROP_LOG_INTERVAL, FORWARD_BATCH};
use retrace_core::VideoFrame;
use retrace_media::Encoder;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sleep when the capture queue is empty.
const IDLE: Duration = Duration::from_millis(2);

/// State shared between the forwarding thread and the engine.
#[derive(Debug, Default)]
pub(crate) struct ForwardState {
    pub stop: AtomicBool,
    /// Frames accepted by the encoder; also the next frame number
    pub accepted: AtomicU64,
    /// Frames the encoder turned away
    pub rejected: AtomicU64,
}

pub(crate) fn run(mut stream: FrameStream, encoder: Arc<Encoder>, state: Arc<ForwardState>) {
    let mut batch: Vec<VideoFrame> = Vec::with_capacity(FORWARD_BATCH);

    while !state.stop.load(Ordering::Acquire) {
        if stream.get_frames(&mut batch, FORWARD_BATCH) == 0 {
            std::thread::sleep(IDLE);
            continue;
        }
        for frame in batch.drain(..) {
            forward_one(&stream, &encoder, &state, frame);
        }
    }

    // Leftovers go back to the pool.
    while let Some(frame) = stream.get_frame() {
        stream.recycle(frame);
    }
    debug!(accepted = state.accepted.load(Ordering::Relaxed), "Forwarding stopped");
}

fn forward_one(stream: &FrameStream, encoder: &Encoder, state: &ForwardState, mut frame: VideoFrame) {
    let number = state.accepted.load(Ordering::Acquire);
    frame.frame_number = number;
    match encoder.submit_video_frame(frame) {
        Ok(()) => {
            state.accepted.store(number + 1, Ordering::Release);
        }
        Err(frame) => {
            stream.recycle(frame);
            let rejected = state.rejected.fetch_add(1, Ordering::Relaxed) + 1;
            if rejected % DROP_LOG_INTERVAL == 1 {
                debug!(rejected, "Encoder queue full, frame dropped");
            }
        }
    }
}
