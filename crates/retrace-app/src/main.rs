//! Retrace - replay recorder
//!
//! Command-line host: records until told to stop and takes attempt and
//! export commands on stdin, one per line.

mod commands;

use anyhow::{bail, Context, Result};
use commands::Command;
use retrace_capture::{CaptureDevice, SyntheticDisplay};
use retrace_core::RecorderConfig;
use retrace_engine::{Engine, ExportHandle};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const USAGE: &str = "usage: retrace [--config <file.json>] [--synthetic]";

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    synthetic: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().context("--config needs a file")?;
                args.config = Some(PathBuf::from(path));
            }
            "--synthetic" => args.synthetic = true,
            "--help" | "-h" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other => bail!("unexpected argument '{}'\n{}", other, USAGE),
        }
    }
    Ok(args)
}

fn build_engine(args: &Args, config: RecorderConfig) -> Result<Engine> {
    if args.synthetic {
        let device: Arc<dyn CaptureDevice> = Arc::new(SyntheticDisplay::new(1920, 1080));
        return Ok(Engine::with_ffmpeg(config, device)?);
    }
    Engine::new(config).context("display capture unavailable, try --synthetic")
}

fn main() -> Result<()> {
    // Initialize logging; RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => RecorderConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => RecorderConfig::default(),
    };

    info!("Retrace starting...");
    let mut engine = build_engine(&args, config)?;
    engine.session_start().context("starting the recording session")?;
    info!("Recording. Commands: attempt <label> [seq], export [path], status, quit");

    let mut exports: Vec<ExportHandle> = Vec::new();
    let mut next_sequence = 1u64;

    for line in std::io::stdin().lock().lines() {
        let line = line?;
        reap_exports(&mut exports, false);

        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                warn!("{}", e);
                continue;
            }
        };

        match command {
            Command::Attempt { label, sequence } => {
                let sequence = sequence.unwrap_or(next_sequence);
                next_sequence = sequence + 1;
                match engine.record_attempt(&label, sequence) {
                    Ok(marker) => info!(frame = marker.frame_number, sequence, "Attempt recorded"),
                    Err(e) => error!("Failed to record attempt: {}", e),
                }
            }
            Command::Export(path) => {
                let path = path.unwrap_or_else(|| engine.generate_suggested_filename());
                match engine.request_export_in_background(path.clone()) {
                    Ok(handle) => {
                        info!(path = %path.display(), "Export started");
                        exports.push(handle);
                    }
                    Err(e) => error!("Export not started: {}", e),
                }
            }
            Command::Status => {
                let stats = engine.stats();
                info!(
                    recording = stats.recording,
                    state = ?stats.capture_state,
                    captured = stats.capture.captured,
                    forwarded = stats.frames_forwarded,
                    rejected = stats.frames_rejected,
                    written = stats.encoder.frames_written,
                    reinits = stats.capture.reinits,
                    attempts = stats.attempts,
                    "Status"
                );
                if let Some(reason) = engine.capture_error() {
                    warn!("Capture stopped: {}", reason);
                }
            }
            Command::Quit => break,
        }
    }

    reap_exports(&mut exports, true);
    engine.session_stop();
    info!("Retrace stopped");
    Ok(())
}

/// Log finished exports; with `wait`, block until all are done.
fn reap_exports(exports: &mut Vec<ExportHandle>, wait: bool) {
    let mut pending = Vec::with_capacity(exports.len());
    for handle in exports.drain(..) {
        if !wait && !handle.is_finished() {
            pending.push(handle);
            continue;
        }
        match handle.join() {
            Ok(report) => info!(
                path = %report.output.display(),
                range = %report.range,
                method = %report.method,
                "Clip saved"
            ),
            Err(e) => error!("Export failed: {}", e),
        }
    }
    *exports = pending;
}
