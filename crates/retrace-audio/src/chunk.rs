//! Interleaved audio sample blocks.

use std::borrow::Cow;
use std::time::Duration;

/// A block of interleaved `f32` samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Interleaved samples, `frames * channels` long
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: channels.max(1),
            sample_rate,
        }
    }

    /// A chunk of silence lasting `frames` sample frames.
    pub fn silence(frames: usize, channels: u16, sample_rate: u32) -> Self {
        let channels = channels.max(1);
        Self::new(vec![0.0; frames * channels as usize], channels, sample_rate)
    }

    /// Number of sample frames (one sample per channel).
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Playback length of this chunk.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_count() as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples as raw `f32le` bytes, the layout fed to the encoder.
    pub fn as_f32le_bytes(&self) -> Cow<'_, [u8]> {
        samples_as_f32le(&self.samples)
    }
}

/// View `samples` as little-endian `f32` bytes, copying only on big-endian hosts.
pub fn samples_as_f32le(samples: &[f32]) -> Cow<'_, [u8]> {
    if cfg!(target_endian = "little") {
        Cow::Borrowed(bytemuck::cast_slice(samples))
    } else {
        Cow::Owned(samples.iter().flat_map(|s| s.to_le_bytes()).collect())
    }
}

/// Number of sample frames covering `elapsed` at `sample_rate`.
pub fn frames_for(elapsed: Duration, sample_rate: u32) -> usize {
    (elapsed.as_secs_f64() * sample_rate as f64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_count_and_duration() {
        let chunk = AudioChunk::new(vec![0.0; 960], 2, 48_000);
        assert_eq!(chunk.frame_count(), 480);
        assert_eq!(chunk.duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_f32le_bytes() {
        let chunk = AudioChunk::new(vec![1.0, -0.5], 2, 48_000);
        let bytes = chunk.as_f32le_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &(-0.5f32).to_le_bytes());
    }

    #[test]
    fn test_silence() {
        let chunk = AudioChunk::silence(100, 2, 44_100);
        assert_eq!(chunk.samples.len(), 200);
        assert!(chunk.samples.iter().all(|s| *s == 0.0));
        assert_eq!(frames_for(Duration::from_millis(500), 48_000), 24_000);
    }
}
