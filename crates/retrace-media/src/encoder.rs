//! Streaming encoder front-end.
//!
//! Frames and audio chunks are queued without blocking and written to the
//! session's [`FrameSink`] by dedicated writer threads. The sink receives one
//! continuous stream for the whole session, so the container it produces can
//! be trimmed while recording continues.

use crate::sink::{FrameSink, SinkFactory, StreamSpec};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use retrace_audio::{frames_for, remix_channels, resample_linear, AudioChunk};
use retrace_core::limits::DROP_LOG_INTERVAL;
use retrace_core::{EncoderConfig, FramePool, Result, RetraceError, VideoFrame};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Idle wait of the writer threads when their queue is empty.
const WRITER_IDLE: Duration = Duration::from_millis(10);

/// Audio may lag wall-clock by this much before silence is inserted.
const AUDIO_SLACK: Duration = Duration::from_millis(40);

/// Encoder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    /// Frames accepted into the queue
    pub frames_submitted: u64,
    /// Frames written to the sink
    pub frames_written: u64,
    /// Frames rejected because the queue was full or the encoder inactive
    pub frames_dropped: u64,
    pub audio_chunks_written: u64,
    pub audio_chunks_dropped: u64,
    /// Sample frames of silence inserted to keep audio up with wall-clock
    pub silence_frames: u64,
}

#[derive(Default)]
struct Shared {
    active: AtomicBool,
    stopping: AtomicBool,
    /// Frames accepted but not yet written
    pending: AtomicUsize,
    frames_submitted: AtomicU64,
    frames_written: AtomicU64,
    frames_dropped: AtomicU64,
    audio_chunks_written: AtomicU64,
    audio_chunks_dropped: AtomicU64,
    silence_frames: AtomicU64,
}

impl Shared {
    fn is_accepting(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.stopping.load(Ordering::Acquire)
    }

    fn count_dropped_frame(&self) {
        let dropped = self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped % DROP_LOG_INTERVAL == 1 {
            debug!(dropped, "Encoder rejected frame");
        }
    }
}

/// Session encoder, shareable between the forwarding thread, the audio
/// producer and the exporter.
pub struct Encoder {
    spec: StreamSpec,
    config: EncoderConfig,
    video_tx: Sender<VideoFrame>,
    /// Kept to reclaim frames queued after the writer has exited
    video_rx: Receiver<VideoFrame>,
    pool: Arc<FramePool>,
    audio_tx: Option<Sender<AudioChunk>>,
    shared: Arc<Shared>,
    video_thread: Mutex<Option<JoinHandle<Box<dyn FrameSink>>>>,
    audio_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Encoder {
    /// Launch the sink and start the writer threads.
    ///
    /// Written frames are handed back to `pool`.
    pub fn start(
        factory: &dyn SinkFactory,
        spec: StreamSpec,
        config: &EncoderConfig,
        pool: Arc<FramePool>,
    ) -> Result<Self> {
        let mut sink = factory.launch(&spec)?;
        let audio_writer = sink.take_audio_writer();

        let shared = Arc::new(Shared::default());
        shared.active.store(true, Ordering::Release);

        let (video_tx, video_rx) = crossbeam_channel::bounded(config.queue_capacity.max(1));
        let video_thread = {
            let shared = Arc::clone(&shared);
            let video_rx = video_rx.clone();
            let pool = Arc::clone(&pool);
            std::thread::Builder::new()
                .name("retrace-encode".to_string())
                .spawn(move || write_video(sink, video_rx, shared, pool))
                .map_err(|e| RetraceError::Encoder(format!("Failed to spawn writer thread: {}", e)))?
        };

        let (audio_tx, audio_thread) = match (audio_writer, spec.audio) {
            (Some(writer), Some(format)) => {
                let (tx, rx) = crossbeam_channel::bounded(spec.audio_queue_capacity.max(1));
                let shared = Arc::clone(&shared);
                let spawned = std::thread::Builder::new()
                    .name("retrace-encode-audio".to_string())
                    .spawn(move || {
                        AudioWriter {
                            writer,
                            rx,
                            shared,
                            sample_rate: format.sample_rate,
                            channels: format.channels,
                            written_frames: 0,
                        }
                        .run()
                    });
                match spawned {
                    Ok(handle) => (Some(tx), Some(handle)),
                    Err(e) => {
                        // Video keeps going without audio.
                        error!("Failed to spawn audio writer thread: {}", e);
                        (None, None)
                    }
                }
            }
            _ => (None, None),
        };

        info!(
            width = spec.width,
            height = spec.height,
            fps = %spec.frame_rate,
            audio = audio_tx.is_some(),
            container = %spec.container.display(),
            "Encoder started"
        );

        Ok(Self {
            spec,
            config: config.clone(),
            video_tx,
            video_rx,
            pool,
            audio_tx,
            shared,
            video_thread: Mutex::new(Some(video_thread)),
            audio_thread: Mutex::new(audio_thread),
        })
    }

    /// Queue a frame without blocking.
    ///
    /// The frame is handed back if the queue is full, the sink failed, or a
    /// stop was requested.
    pub fn submit_video_frame(&self, frame: VideoFrame) -> std::result::Result<(), VideoFrame> {
        if !self.shared.is_accepting() {
            self.shared.count_dropped_frame();
            return Err(frame);
        }
        self.enqueue(frame)
    }

    fn enqueue(&self, frame: VideoFrame) -> std::result::Result<(), VideoFrame> {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        match self.video_tx.try_send(frame) {
            Ok(()) => {
                self.shared.frames_submitted.fetch_add(1, Ordering::Relaxed);
                // The writer may have failed after the acceptance check.
                if !self.shared.active.load(Ordering::Acquire) {
                    self.discard_queued();
                }
                Ok(())
            }
            Err(TrySendError::Full(frame)) | Err(TrySendError::Disconnected(frame)) => {
                self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                self.shared.count_dropped_frame();
                Err(frame)
            }
        }
    }

    /// Queue an audio chunk without blocking; returned on rejection.
    pub fn submit_audio_chunk(&self, chunk: AudioChunk) -> std::result::Result<(), AudioChunk> {
        let Some(tx) = &self.audio_tx else {
            return Err(chunk);
        };
        if !self.shared.is_accepting() {
            return Err(chunk);
        }
        tx.try_send(chunk).map_err(|e| {
            self.shared.audio_chunks_dropped.fetch_add(1, Ordering::Relaxed);
            e.into_inner()
        })
    }

    /// Wait for queued frames to reach the sink, then let it settle.
    ///
    /// Returns `false` if the queue did not drain within the flush timeout
    /// or the encoder is no longer active.
    pub fn flush(&self) -> bool {
        let deadline = Instant::now() + self.config.flush_timeout();
        let mut drained = false;
        while self.shared.active.load(Ordering::Acquire) {
            if self.shared.pending.load(Ordering::Acquire) == 0 {
                drained = true;
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        if drained {
            std::thread::sleep(self.config.flush_grace());
        } else {
            warn!(
                pending = self.shared.pending.load(Ordering::Relaxed),
                active = self.is_active(),
                "Encoder flush incomplete"
            );
        }
        drained
    }

    /// Stop accepting input, drain the writers and close the sink. Idempotent.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);

        if let Some(handle) = self.audio_thread.lock().take() {
            if handle.join().is_err() {
                error!("Audio writer thread panicked");
            }
        }

        let Some(handle) = self.video_thread.lock().take() else {
            return;
        };
        match handle.join() {
            Ok(mut sink) => {
                if let Err(e) = sink.close(self.config.stop_grace()) {
                    warn!("Encoder sink did not close cleanly: {}", e);
                }
            }
            Err(_) => error!("Video writer thread panicked"),
        }
        self.shared.active.store(false, Ordering::Release);
        self.discard_queued();

        let stats = self.stats();
        info!(
            written = stats.frames_written,
            dropped = stats.frames_dropped,
            "Encoder stopped"
        );
    }

    /// Return frames nobody will write to the pool.
    fn discard_queued(&self) {
        for frame in self.video_rx.try_iter() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            self.shared.count_dropped_frame();
            self.pool.release(frame);
        }
    }

    /// Whether the sink is still accepting data.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn has_audio(&self) -> bool {
        self.audio_tx.is_some()
    }

    /// Frames accepted but not yet written.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    pub fn stats(&self) -> EncoderStats {
        let s = &self.shared;
        EncoderStats {
            frames_submitted: s.frames_submitted.load(Ordering::Relaxed),
            frames_written: s.frames_written.load(Ordering::Relaxed),
            frames_dropped: s.frames_dropped.load(Ordering::Relaxed),
            audio_chunks_written: s.audio_chunks_written.load(Ordering::Relaxed),
            audio_chunks_dropped: s.audio_chunks_dropped.load(Ordering::Relaxed),
            silence_frames: s.silence_frames.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_video(
    mut sink: Box<dyn FrameSink>,
    rx: Receiver<VideoFrame>,
    shared: Arc<Shared>,
    pool: Arc<FramePool>,
) -> Box<dyn FrameSink> {
    loop {
        let frame = match rx.recv_timeout(WRITER_IDLE) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => {
                if shared.stopping.load(Ordering::Acquire) {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let result = sink.write_frame(&frame);
        shared.pending.fetch_sub(1, Ordering::AcqRel);
        pool.release(frame);

        if let Err(e) = result {
            warn!("Encoder input closed, recording stops here: {}", e);
            shared.active.store(false, Ordering::Release);
            for frame in rx.try_iter() {
                shared.pending.fetch_sub(1, Ordering::AcqRel);
                pool.release(frame);
            }
            break;
        }
        shared.frames_written.fetch_add(1, Ordering::Relaxed);
    }
    sink
}

struct AudioWriter {
    writer: Box<dyn Write + Send>,
    rx: Receiver<AudioChunk>,
    shared: Arc<Shared>,
    sample_rate: u32,
    channels: u16,
    written_frames: usize,
}

impl AudioWriter {
    fn run(mut self) {
        let started = Instant::now();
        let slack = frames_for(AUDIO_SLACK, self.sample_rate);

        while self.shared.active.load(Ordering::Acquire) {
            if self.shared.stopping.load(Ordering::Acquire) {
                // Whatever was queued before the stop still goes out.
                let queued: Vec<AudioChunk> = self.rx.try_iter().collect();
                for chunk in queued {
                    if self.write_chunk(chunk).is_err() {
                        break;
                    }
                }
                break;
            }

            let result = match self.rx.recv_timeout(WRITER_IDLE) {
                Ok(chunk) => self.write_chunk(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    let due = frames_for(started.elapsed(), self.sample_rate);
                    if due > self.written_frames + slack {
                        self.write_silence(due - self.written_frames)
                    } else {
                        Ok(())
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            if let Err(e) = result {
                warn!("Audio input closed, continuing video only: {}", e);
                break;
            }
        }
        debug!(frames = self.written_frames, "Audio writer finished");
    }

    fn write_chunk(&mut self, chunk: AudioChunk) -> std::io::Result<()> {
        let samples = if chunk.channels == self.channels {
            chunk.samples
        } else {
            remix_channels(&chunk.samples, chunk.channels, self.channels)
        };
        let samples = if chunk.sample_rate == self.sample_rate {
            samples
        } else {
            resample_linear(&samples, self.channels, chunk.sample_rate, self.sample_rate)
        };

        let converted = AudioChunk::new(samples, self.channels, self.sample_rate);
        self.writer.write_all(&converted.as_f32le_bytes())?;
        self.written_frames += converted.frame_count();
        self.shared.audio_chunks_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_silence(&mut self, frames: usize) -> std::io::Result<()> {
        let silence = AudioChunk::silence(frames, self.channels, self.sample_rate);
        self.writer.write_all(&silence.as_f32le_bytes())?;
        self.written_frames += frames;
        self.shared.silence_frames.fetch_add(frames as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySinkFactory;
    use retrace_core::{PixelFormat, RecorderConfig};

    fn setup(audio: bool) -> (MemorySinkFactory, StreamSpec, EncoderConfig, Arc<FramePool>) {
        let mut config = RecorderConfig::default();
        config.capture.width = 8;
        config.capture.height = 4;
        config.audio.enabled = audio;
        config.encoder.flush_grace_ms = 0;
        config.encoder.flush_timeout_ms = 1000;
        let spec = StreamSpec::from_config(&config);
        let pool = Arc::new(FramePool::new(8, 4, PixelFormat::Rgb24, 4));
        (MemorySinkFactory::new(), spec, config.encoder, pool)
    }

    fn numbered(pool: &FramePool, n: u64) -> VideoFrame {
        let mut frame = pool.acquire();
        frame.frame_number = n;
        frame
    }

    #[test]
    fn test_frames_reach_sink_in_order() {
        let (factory, spec, config, pool) = setup(false);
        let encoder = Encoder::start(&factory, spec, &config, Arc::clone(&pool)).unwrap();

        let mut accepted = 0;
        for _ in 0..20 {
            match encoder.submit_video_frame(numbered(&pool, accepted)) {
                Ok(()) => accepted += 1,
                Err(frame) => {
                    assert_eq!(frame.frame_number, accepted);
                    pool.release(frame);
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
        }
        assert!(encoder.flush());
        encoder.stop();

        let expected: Vec<u64> = (0..accepted).collect();
        assert_eq!(factory.frame_numbers(), expected);
        assert_eq!(encoder.stats().frames_written, accepted);
        assert!(factory.with_recording(|r| r.closed));
    }

    #[test]
    fn test_write_failure_disables_submission() {
        let (factory, spec, config, pool) = setup(false);
        factory.fail_after(2);
        let encoder = Encoder::start(&factory, spec, &config, Arc::clone(&pool)).unwrap();

        for n in 0..3 {
            let _ = encoder.submit_video_frame(numbered(&pool, n));
            std::thread::sleep(Duration::from_millis(30));
        }
        assert!(!encoder.is_active());
        assert!(encoder.submit_video_frame(numbered(&pool, 3)).is_err());
        assert!(!encoder.flush());
        assert_eq!(factory.frame_numbers(), vec![0, 1]);
        encoder.stop();
    }

    #[test]
    fn test_frames_queued_after_writer_exit_are_reclaimed() {
        let (factory, spec, config, pool) = setup(false);
        factory.fail_after(0);
        let encoder = Encoder::start(&factory, spec, &config, Arc::clone(&pool)).unwrap();

        encoder.submit_video_frame(numbered(&pool, 0)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while encoder.is_active() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!encoder.is_active());

        // A frame that passed the acceptance check just before the failure.
        let late = numbered(&pool, 1);
        let idle = pool.idle_count();
        assert!(encoder.enqueue(late).is_ok());
        assert_eq!(encoder.pending(), 0);
        assert_eq!(pool.idle_count(), idle + 1);
        assert!(factory.frame_numbers().is_empty());
        encoder.stop();
        assert_eq!(encoder.pending(), 0);
    }

    #[test]
    fn test_stop_twice_and_reject_after_stop() {
        let (factory, spec, config, pool) = setup(false);
        let encoder = Encoder::start(&factory, spec, &config, Arc::clone(&pool)).unwrap();
        encoder.stop();
        encoder.stop();
        assert!(encoder.submit_video_frame(numbered(&pool, 0)).is_err());
        assert_eq!(factory.with_recording(|r| r.launches), 1);
    }

    #[test]
    fn test_audio_is_padded_with_silence() {
        let (factory, spec, config, pool) = setup(true);
        let encoder = Encoder::start(&factory, spec, &config, pool).unwrap();
        assert!(encoder.has_audio());

        encoder
            .submit_audio_chunk(AudioChunk::new(vec![0.25; 480 * 2], 2, 48_000))
            .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        encoder.stop();

        let stats = encoder.stats();
        assert_eq!(stats.audio_chunks_written, 1);
        assert!(stats.silence_frames > 0);
        let audio_bytes = factory.with_recording(|r| r.audio.len());
        assert_eq!(audio_bytes as u64, (480 + stats.silence_frames) * 2 * 4);
    }

    #[test]
    fn test_audio_rejected_without_audio_stream() {
        let (factory, spec, config, pool) = setup(false);
        let encoder = Encoder::start(&factory, spec, &config, pool).unwrap();
        let chunk = AudioChunk::silence(10, 2, 48_000);
        assert!(encoder.submit_audio_chunk(chunk).is_err());
    }

    #[test]
    fn test_launch_failure_is_reported() {
        let (factory, spec, config, pool) = setup(false);
        factory.fail_launch(true);
        let result = Encoder::start(&factory, spec, &config, pool);
        assert!(matches!(result, Err(RetraceError::Encoder(_))));
    }
}
