//! Clip export through the engine.

use crate::support::{small_config, wait_for_forwarded, RecordingTrimmer};
use proptest::prelude::*;
use retrace_capture::SyntheticDisplay;
use retrace_core::{ClipSettings, ExportPolicy, FrameRate, RecorderConfig, RetraceError};
use retrace_engine::Engine;
use retrace_media::{ClipRange, ExportMethod, MemorySinkFactory};
use std::sync::Arc;

fn engine_with(config: RecorderConfig) -> (Engine, Arc<RecordingTrimmer>) {
    let trimmer = Arc::new(RecordingTrimmer::default());
    let engine = Engine::with_components(
        config,
        Arc::new(SyntheticDisplay::new(64, 36)),
        Arc::new(MemorySinkFactory::new()),
        Arc::clone(&trimmer) as Arc<dyn retrace_media::ClipTrimmer>,
    )
    .unwrap();
    (engine, trimmer)
}

#[test]
fn export_covers_the_latest_window() {
    let dir = tempfile::tempdir().unwrap();
    let config = small_config(dir.path());
    let settings = config.clip.clone();
    let rate = config.capture.frame_rate;
    let (mut engine, trimmer) = engine_with(config);
    engine.session_start().unwrap();

    let mut markers = Vec::new();
    for sequence in 1..=3 {
        let marker = engine.record_attempt("Clubstep", sequence).unwrap();
        assert!(wait_for_forwarded(&engine, marker.frame_number + 4));
        markers.push(marker);
    }

    let output = dir.path().join("clips").join("window.mp4");
    let report = engine.request_export(&output).unwrap();

    // Window of two: the first attempt has rolled out.
    assert_eq!(report.markers_used, 2);
    assert_eq!(report.first_attempt, markers[1]);
    assert_eq!(report.last_attempt, markers[2]);
    assert_eq!(report.method, ExportMethod::StreamCopy);

    let expected = ClipRange::from_markers(markers[1].frame_number, markers[2].frame_number, rate, &settings);
    assert_eq!(report.range, expected);
    assert_eq!(trimmer.last_range(), Some(expected));
    assert!(output.exists());
    engine.session_stop();
}

#[test]
fn failed_export_leaves_recording_running() {
    let dir = tempfile::tempdir().unwrap();
    let (mut engine, trimmer) = engine_with(small_config(dir.path()));
    engine.session_start().unwrap();
    engine.record_attempt("Theory of Everything", 1).unwrap();
    engine.record_attempt("Theory of Everything", 2).unwrap();

    trimmer.set_failing(true);
    let output = dir.path().join("clips").join("failed.mp4");
    let err = engine.request_export(&output).unwrap_err();
    assert!(matches!(err, RetraceError::Export(_)), "{}", err);
    assert!(!output.exists());
    assert!(engine.is_recording());

    // Stream copy, then re-encode.
    let methods: Vec<ExportMethod> = trimmer.calls.lock().iter().map(|(_, _, m)| *m).collect();
    assert_eq!(methods, vec![ExportMethod::StreamCopy, ExportMethod::Reencode]);

    trimmer.set_failing(false);
    let report = engine
        .request_export_in_background(output.clone())
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(report.output, output);
    assert!(output.exists());
    engine.session_stop();
}

#[test]
fn export_policy_decides_single_marker_exports() {
    let dir = tempfile::tempdir().unwrap();

    let mut strict = small_config(dir.path());
    strict.clip.policy = ExportPolicy::RequireFull;
    let (mut engine, trimmer) = engine_with(strict);
    engine.session_start().unwrap();
    engine.record_attempt("Electrodynamix", 1).unwrap();
    let err = engine.request_export(&dir.path().join("strict.mp4")).unwrap_err();
    assert!(matches!(err, RetraceError::InsufficientMarkers { have: 1, need: 2 }));
    assert!(trimmer.calls.lock().is_empty());
    engine.session_stop();

    let mut lenient = small_config(dir.path());
    lenient.clip.policy = ExportPolicy::RequireAny;
    let (mut engine, _) = engine_with(lenient);
    engine.session_start().unwrap();
    let err = engine.request_export(&dir.path().join("empty.mp4")).unwrap_err();
    assert!(matches!(err, RetraceError::InsufficientMarkers { have: 0, need: 1 }));

    engine.record_attempt("Electrodynamix", 1).unwrap();
    let report = engine.request_export(&dir.path().join("lenient.mp4")).unwrap();
    assert_eq!(report.markers_used, 1);
    assert!(report.range.duration >= 2.0);
    engine.session_stop();
}

#[test]
fn reference_range_at_thirty_fps() {
    let range = ClipRange::from_markers(0, 150, FrameRate::FPS_30, &ClipSettings::default());
    assert_eq!(range.start, 0.0);
    assert!((range.duration - 5.5).abs() < 1e-9);
}

proptest! {
    #[test]
    fn clip_range_is_padded_and_non_negative(
        oldest in 0u64..100_000,
        span in 0u64..10_000,
        min in 0.0f64..10.0,
        lead in 0.0f64..2.0,
        trail in 0.0f64..2.0,
    ) {
        let settings = ClipSettings {
            min_duration_secs: min,
            lead_in_secs: lead,
            trail_secs: trail,
            ..ClipSettings::default()
        };
        let rate = FrameRate::FPS_30;
        let range = ClipRange::from_markers(oldest, oldest + span, rate, &settings);

        prop_assert!(range.start >= 0.0);
        prop_assert!(range.start <= rate.frame_to_seconds(oldest));
        prop_assert!(range.duration >= min + trail - 1e-9);
        prop_assert!(range.duration >= rate.frame_to_seconds(span) + trail - 1e-6);
    }
}
