//! Retrace Audio - best-effort audio for the recording
//!
//! Architecture:
//! - `AudioChunk`: interleaved `f32` blocks handed to the encoder
//! - `mix`: game/microphone mixdown and format conversion
//! - `MicBuffer`: bounded microphone sample FIFO drained at mix time
//! - `MicrophoneCapture`: default input device (feature `microphone`)

pub mod chunk;
pub mod mic;
pub mod mix;

pub use chunk::{frames_for, samples_as_f32le, AudioChunk};
pub use mic::MicBuffer;
#[cfg(feature = "microphone")]
pub use mic::MicrophoneCapture;
pub use mix::{mix_game_and_mic, mix_into, remix_channels, resample_linear, MixLevels};
