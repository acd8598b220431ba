//! Capture -> forward -> encoder, end to end.

use crate::support::{
    assert_gap_free, small_config, wait_for, wait_for_forwarded, RecordingTrimmer, SlowSinkFactory,
};
use retrace_capture::{CaptureState, SyntheticDisplay};
use retrace_engine::Engine;
use retrace_media::MemorySinkFactory;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn slow_encoder_drops_frames_without_number_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = small_config(dir.path());
    config.encoder.queue_capacity = 1;

    // 30 fps capture into a sink that manages about 16.
    let sinks = SlowSinkFactory::new(Duration::from_millis(60));
    let mut engine = Engine::with_components(
        config,
        Arc::new(SyntheticDisplay::new(64, 36)),
        Arc::new(sinks.clone()),
        Arc::new(RecordingTrimmer::default()),
    )
    .unwrap();

    engine.session_start().unwrap();
    assert!(wait_for(|| sinks.frame_numbers().len() >= 8));
    let stats = engine.stats();
    engine.session_stop();

    assert!(stats.frames_rejected > 0, "{:?}", stats);
    let numbers = sinks.frame_numbers();
    assert!(numbers.len() >= 8);
    assert_gap_free(&numbers);
}

#[test]
fn device_loss_keeps_encoder_numbering_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let display = SyntheticDisplay::new(64, 36);
    let controls = display.controls();
    let sinks = MemorySinkFactory::new();
    let mut engine = Engine::with_components(
        small_config(dir.path()),
        Arc::new(display),
        Arc::new(sinks.clone()),
        Arc::new(RecordingTrimmer::default()),
    )
    .unwrap();

    engine.session_start().unwrap();
    assert!(wait_for_forwarded(&engine, 3));

    controls.lose_access();
    assert!(wait_for(|| engine.stats().capture.reinits == 1));
    let before = engine.stats().frames_forwarded;
    assert!(wait_for_forwarded(&engine, before + 3));

    let stats = engine.stats();
    assert_eq!(stats.capture_state, Some(CaptureState::Capturing));
    assert_eq!(controls.open_count(), 2);
    engine.session_stop();

    assert_gap_free(&sinks.frame_numbers());
}

#[test]
fn attempt_markers_follow_the_encoder() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = Engine::with_components(
        small_config(dir.path()),
        Arc::new(SyntheticDisplay::new(64, 36)),
        Arc::new(MemorySinkFactory::new()),
        Arc::new(RecordingTrimmer::default()),
    )
    .unwrap();
    engine.session_start().unwrap();

    let first = engine.record_attempt("Jumper", 1).unwrap();
    assert!(wait_for_forwarded(&engine, first.frame_number + 5));
    let second = engine.record_attempt("Jumper", 2).unwrap();

    assert!(second.frame_number >= first.frame_number + 5);
    assert!(second.frame_number <= engine.stats().frames_forwarded);

    let snapshot = engine.ledger().snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0], second);
    assert_eq!(snapshot[1], first);
    engine.session_stop();
}

#[test]
fn restarted_session_starts_clean() {
    let dir = tempfile::tempdir().unwrap();
    let sinks = MemorySinkFactory::new();
    let mut engine = Engine::with_components(
        small_config(dir.path()),
        Arc::new(SyntheticDisplay::new(64, 36)),
        Arc::new(sinks.clone()),
        Arc::new(RecordingTrimmer::default()),
    )
    .unwrap();

    engine.session_start().unwrap();
    engine.record_attempt("Polargeist", 1).unwrap();
    assert!(wait_for_forwarded(&engine, 3));
    engine.session_stop();
    assert!(!engine.is_recording());
    assert!(engine.record_attempt("Polargeist", 2).is_err());

    engine.session_start().unwrap();
    assert!(engine.ledger().is_empty());
    assert_eq!(engine.stats().attempts, 0);
    assert!(wait_for_forwarded(&engine, 1));
    engine.session_stop();
    engine.session_stop();

    assert_eq!(sinks.with_recording(|r| r.launches), 2);
}
