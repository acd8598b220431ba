//! Recording and trimming with a real FFmpeg binary.
//!
//! Ignored by default; run with `--ignored` on a machine with `ffmpeg` on
//! the PATH.

use crate::support::{small_config, wait_for_forwarded};
use retrace_capture::SyntheticDisplay;
use retrace_engine::Engine;
use retrace_media::ExportMethod;
use std::sync::Arc;
use std::time::Duration;

#[test]
#[ignore = "needs ffmpeg"]
fn records_and_exports_with_ffmpeg() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_config(dir.path());
    config.encoder.hardware_acceleration = false;
    config.audio.enabled = false;

    let mut engine = Engine::with_ffmpeg(config, Arc::new(SyntheticDisplay::new(64, 36))).unwrap();
    engine.session_start().unwrap();

    let first = engine.record_attempt("Stereo Madness", 1).unwrap();
    assert!(wait_for_forwarded(&engine, first.frame_number + 60));
    engine.record_attempt("Stereo Madness", 2).unwrap();
    std::thread::sleep(Duration::from_millis(500));

    let output = engine.generate_suggested_filename();
    let report = engine.request_export(&output).unwrap();
    assert_eq!(report.method, ExportMethod::StreamCopy);
    assert!(std::fs::metadata(&output).unwrap().len() > 0);

    let container = engine.config().encoder.container_path.clone();
    engine.session_stop();
    assert!(!container.exists());
}

#[test]
#[ignore = "needs ffmpeg"]
fn records_game_audio_with_ffmpeg() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_config(dir.path());
    config.encoder.hardware_acceleration = false;
    config.encoder.keep_container = true;
    config.audio.enabled = true;
    config.audio.microphone = false;

    let mut engine = Engine::with_ffmpeg(config, Arc::new(SyntheticDisplay::new(64, 36))).unwrap();
    engine.session_start().unwrap();

    let tone: Vec<f32> = (0..960).map(|i| (i as f32 * 0.05).sin() * 0.25).collect();
    let mut accepted = 0;
    for _ in 0..50 {
        accepted += usize::from(engine.submit_audio(&tone));
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(accepted > 0);

    let container = engine.config().encoder.container_path.clone();
    engine.session_stop();
    assert!(std::fs::metadata(&container).unwrap().len() > 0);
}
