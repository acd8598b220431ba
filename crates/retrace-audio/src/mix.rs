//! Game and microphone mixdown.

use retrace_core::AudioSettings;

/// Per-source gains applied before summing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixLevels {
    /// Game volume (0.0 to 1.0).
    pub game: f32,
    /// Microphone volume (0.0 to 1.0).
    pub mic: f32,
}

impl Default for MixLevels {
    fn default() -> Self {
        Self { game: 0.7, mic: 0.3 }
    }
}

impl From<&AudioSettings> for MixLevels {
    fn from(settings: &AudioSettings) -> Self {
        Self {
            game: settings.game_volume,
            mic: settings.mic_volume,
        }
    }
}

/// Mix game and microphone samples into a new buffer the length of `game`.
///
/// Missing microphone samples count as silence; the result is clamped to
/// [-1, 1].
pub fn mix_game_and_mic(game: &[f32], mic: &[f32], game_volume: f32, mic_volume: f32) -> Vec<f32> {
    let mut out = vec![0.0; game.len()];
    mix_into(&mut out, game, mic, MixLevels { game: game_volume, mic: mic_volume });
    out
}

/// Mix into a caller-provided buffer of `game.len()` samples.
pub fn mix_into(out: &mut [f32], game: &[f32], mic: &[f32], levels: MixLevels) {
    for (i, (dst, g)) in out.iter_mut().zip(game).enumerate() {
        let m = mic.get(i).copied().unwrap_or(0.0);
        *dst = (g * levels.game + m * levels.mic).clamp(-1.0, 1.0);
    }
}

/// Convert interleaved samples between channel counts.
///
/// Mono is duplicated into every output channel; extra input channels are
/// averaged down when going to mono and dropped otherwise.
pub fn remix_channels(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    let (from, to) = (from.max(1) as usize, to.max(1) as usize);
    if from == to {
        return samples.to_vec();
    }

    let frames = samples.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if from == 1 {
            out.extend(std::iter::repeat(frame[0]).take(to));
        } else if to == 1 {
            out.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            for ch in 0..to {
                out.push(frame.get(ch).copied().unwrap_or(0.0));
            }
        }
    }
    out
}

/// Linear resample of interleaved samples from `from_rate` to `to_rate`.
pub fn resample_linear(samples: &[f32], channels: u16, from_rate: u32, to_rate: u32) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let in_frames = samples.len() / channels;
    let out_frames = (in_frames as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let mut out = Vec::with_capacity(out_frames * channels);

    for i in 0..out_frames {
        let pos = i as f64 * step;
        let base = (pos.floor() as usize).min(in_frames - 1);
        let next = (base + 1).min(in_frames - 1);
        let frac = (pos - base as f64) as f32;
        for ch in 0..channels {
            let a = samples[base * channels + ch];
            let b = samples[next * channels + ch];
            out.push(a + (b - a) * frac);
        }
    }
    out
}
