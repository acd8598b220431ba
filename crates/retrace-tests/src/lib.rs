//! Integration test crate for Retrace.
//!
//! This crate exists solely to hold cross-crate integration tests.
//! It drives the engine with synthetic capture devices and in-process
//! sinks so the whole pipeline runs without a display or FFmpeg.

#[cfg(test)]
mod support;

#[cfg(test)]
mod pipeline;

#[cfg(test)]
mod export;

#[cfg(test)]
mod ffmpeg;
