//! Microphone capture.
//!
//! The input stream runs on its own thread (cpal streams are not `Send` on
//! every platform) and pushes samples, already converted to the recording
//! format, into a bounded [`MicBuffer`] that the engine drains when it mixes
//! game audio.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{error, warn};

/// Bounded FIFO of microphone samples; the oldest samples are discarded
/// when it overflows.
#[derive(Debug)]
pub struct MicBuffer {
    samples: Mutex<VecDeque<f32>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl MicBuffer {
    /// Create a buffer holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append samples, discarding the oldest on overflow.
    pub fn push(&self, data: &[f32]) {
        let mut samples = self.samples.lock();
        samples.extend(data.iter().copied());
        let excess = samples.len().saturating_sub(self.capacity);
        if excess > 0 {
            samples.drain(..excess);
            let dropped = self.dropped.fetch_add(excess as u64, Ordering::Relaxed) + excess as u64;
            if dropped % (self.capacity as u64 * 8) < excess as u64 {
                warn!(dropped, "Microphone buffer overflowing, discarding oldest samples");
            }
        }
    }

    /// Remove and return up to `count` of the oldest samples.
    pub fn take(&self, count: usize) -> Vec<f32> {
        let mut samples = self.samples.lock();
        let n = count.min(samples.len());
        samples.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Total samples discarded on overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }
}

#[cfg(feature = "microphone")]
pub use capture::MicrophoneCapture;

/// Join the microphone thread; `false` if it panicked.
#[cfg_attr(not(feature = "microphone"), allow(dead_code))]
fn join_mic_thread(thread: JoinHandle<()>) -> bool {
    if thread.join().is_err() {
        error!("Microphone thread panicked");
        return false;
    }
    true
}

#[cfg(feature = "microphone")]
mod capture {
    use super::{join_mic_thread, MicBuffer};
    use crate::mix::{remix_channels, resample_linear};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use retrace_core::{Result, RetraceError};
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use tracing::{error, info};

    /// Default input device feeding a [`MicBuffer`].
    pub struct MicrophoneCapture {
        buffer: Arc<MicBuffer>,
        stop_tx: Option<crossbeam_channel::Sender<()>>,
        thread: Option<JoinHandle<()>>,
    }

    impl MicrophoneCapture {
        /// Open the default input device and start streaming into `buffer`,
        /// converted to `channels` at `sample_rate`.
        pub fn start(buffer: Arc<MicBuffer>, channels: u16, sample_rate: u32) -> Result<Self> {
            let (init_tx, init_rx) = crossbeam_channel::bounded(1);
            let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
            let sink = Arc::clone(&buffer);

            let thread = std::thread::Builder::new()
                .name("retrace-mic".to_string())
                .spawn(move || {
                    let stream = match open_stream(sink, channels, sample_rate) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = init_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = init_tx.send(Ok(()));
                    // Park until stop; dropping the stream closes the device.
                    let _ = stop_rx.recv();
                    drop(stream);
                })
                .map_err(|e| RetraceError::Audio(format!("Failed to spawn microphone thread: {}", e)))?;

            match init_rx.recv() {
                Ok(Ok(())) => Ok(Self {
                    buffer,
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                }),
                Ok(Err(e)) => {
                    join_mic_thread(thread);
                    Err(e)
                }
                Err(_) => {
                    join_mic_thread(thread);
                    Err(RetraceError::Audio("microphone thread exited during setup".to_string()))
                }
            }
        }

        pub fn buffer(&self) -> &Arc<MicBuffer> {
            &self.buffer
        }

        /// Close the input device. Idempotent.
        pub fn stop(&mut self) {
            if let Some(stop_tx) = self.stop_tx.take() {
                let _ = stop_tx.send(());
            }
            if let Some(thread) = self.thread.take() {
                join_mic_thread(thread);
                info!("Microphone capture stopped");
            }
        }
    }

    impl Drop for MicrophoneCapture {
        fn drop(&mut self) {
            self.stop();
        }
    }

    fn open_stream(buffer: Arc<MicBuffer>, channels: u16, sample_rate: u32) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| RetraceError::Audio("No input device available".to_string()))?;
        let supported = device
            .default_input_config()
            .map_err(|e| RetraceError::Audio(format!("No input config: {}", e)))?;

        let device_channels = supported.channels();
        let device_rate = supported.sample_rate().0;
        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            channels = device_channels,
            rate = device_rate,
            "Microphone opened"
        );

        let config: cpal::StreamConfig = supported.config();
        let convert = move |samples: &[f32]| {
            let remixed = remix_channels(samples, device_channels, channels);
            let resampled = resample_linear(&remixed, channels, device_rate, sample_rate);
            buffer.push(&resampled);
        };
        let err_fn = |err: cpal::StreamError| error!("Microphone stream error: {}", err);

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| convert(data),
                err_fn,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let floats: Vec<f32> = data.iter().map(|s| *s as f32 / i16::MAX as f32).collect();
                    convert(&floats)
                },
                err_fn,
                None,
            ),
            other => {
                return Err(RetraceError::Audio(format!(
                    "Unsupported microphone sample format {:?}",
                    other
                )))
            }
        }
        .map_err(|e| RetraceError::Audio(format!("Failed to open microphone stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| RetraceError::Audio(format!("Failed to start microphone: {}", e)))?;
        Ok(stream)
    }
}
