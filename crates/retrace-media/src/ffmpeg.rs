//! ffmpeg as the session encoder and clip trimmer.
//!
//! The recording process reads raw frames from its stdin and, when audio is
//! enabled, raw `f32le` samples from a loopback TCP connection it opens back
//! to us. Output goes to an MPEG-TS container, which stays readable while it
//! grows. ffmpeg is run as a sidecar process through `ffmpeg-sidecar`.

use crate::export::{ClipRange, ClipTrimmer, ExportMethod};
use crate::sink::{write_frame_rows, FrameSink, SinkFactory, StreamSpec};
use ffmpeg_sidecar::child::FfmpegChild;
use ffmpeg_sidecar::command::FfmpegCommand;
use parking_lot::Mutex;
use retrace_core::{Result, RetraceError, VideoFrame};
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long a freshly launched recorder must survive before it is trusted.
const STARTUP_PROBE: Duration = Duration::from_millis(250);

/// How long to wait for the recorder to connect to the audio socket.
const AUDIO_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lines of ffmpeg output kept for error reports.
const LOG_TAIL: usize = 20;

/// H.264 encoder used for the session recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    X264,
    Nvenc,
}

impl VideoCodec {
    pub fn as_ffmpeg_codec(self) -> &'static str {
        match self {
            Self::X264 => "libx264",
            Self::Nvenc => "h264_nvenc",
        }
    }

    fn args(self) -> &'static [&'static str] {
        match self {
            Self::X264 => &["-c:v", "libx264", "-preset", "ultrafast", "-tune", "zerolatency"],
            Self::Nvenc => &["-c:v", "h264_nvenc", "-preset", "p4"],
        }
    }
}

/// Find the ffmpeg binary: the configured path if set, else `PATH`.
pub fn locate_ffmpeg(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(RetraceError::Encoder(format!(
            "Configured ffmpeg binary {} does not exist",
            path.display()
        )));
    }
    which::which("ffmpeg").map_err(|e| RetraceError::Encoder(format!("ffmpeg not found on PATH: {}", e)))
}

fn command(ffmpeg: &Path) -> FfmpegCommand {
    let mut cmd = FfmpegCommand::new_with_path(ffmpeg);
    cmd.hide_banner();
    cmd.as_inner_mut().stdout(Stdio::null());
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        cmd.as_inner_mut().creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Arguments for the session recording process.
pub fn recording_args(spec: &StreamSpec, codec: VideoCodec, audio_addr: Option<SocketAddr>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-loglevel".into(),
        "warning".into(),
        "-nostats".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pixel_format".into(),
        spec.pixel_format.ffmpeg_name().into(),
        "-video_size".into(),
        format!("{}x{}", spec.width, spec.height),
        "-framerate".into(),
        spec.frame_rate.ffmpeg_rate(),
        "-i".into(),
        "pipe:0".into(),
    ];

    let audio = spec.audio.zip(audio_addr);
    if let Some((format, addr)) = audio {
        args.extend([
            "-f".into(),
            "f32le".into(),
            "-ar".into(),
            format.sample_rate.to_string(),
            "-ac".into(),
            format.channels.to_string(),
            "-i".into(),
            format!("tcp://{}", addr),
        ]);
        args.extend(["-map".into(), "0:v".into(), "-map".into(), "1:a".into()]);
    }

    args.extend(codec.args().iter().map(|a| a.to_string()));
    args.extend([
        "-b:v".into(),
        format!("{}M", spec.video_bitrate_mbps),
        "-g".into(),
        spec.frame_rate.frames_per_second_ceil().to_string(),
        "-pix_fmt".into(),
        "yuv420p".into(),
    ]);
    if audio.is_some() {
        args.extend(["-c:a".into(), "aac".into(), "-b:a".into(), "128k".into()]);
    }
    args.extend([
        "-flush_packets".into(),
        "1".into(),
        "-f".into(),
        "mpegts".into(),
        spec.container.to_string_lossy().into_owned(),
    ]);
    args
}

/// Arguments cutting `range` out of `container` into `output`.
pub fn trim_args(container: &Path, range: ClipRange, output: &Path, method: ExportMethod) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-nostdin".into(),
        "-loglevel".into(),
        "error".into(),
        "-ss".into(),
        format!("{:.3}", range.start),
        "-i".into(),
        container.to_string_lossy().into_owned(),
        "-t".into(),
        format!("{:.3}", range.duration),
    ];
    match method {
        ExportMethod::StreamCopy => {
            args.extend(["-c".into(), "copy".into(), "-avoid_negative_ts".into(), "make_zero".into()]);
        }
        ExportMethod::Reencode => {
            args.extend([
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "veryfast".into(),
                "-pix_fmt".into(),
                "yuv420p".into(),
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                "128k".into(),
            ]);
        }
    }
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Check that `codec` can actually encode on this machine.
pub fn probe_encoder(ffmpeg: &Path, codec: VideoCodec) -> bool {
    let mut cmd = command(ffmpeg);
    cmd.args([
        "-nostdin",
        "-loglevel",
        "error",
        "-f",
        "lavfi",
        "-i",
        "color=black:s=256x144:d=0.1",
        "-c:v",
        codec.as_ffmpeg_codec(),
        "-f",
        "null",
        "-",
    ]);
    match run_to_completion(&mut cmd) {
        Ok((status, _)) if status.success() => true,
        Ok((status, log)) => {
            debug!(codec = codec.as_ffmpeg_codec(), %status, log = %log.join(" | "), "Encoder probe failed");
            false
        }
        Err(e) => {
            debug!("Encoder probe could not run: {}", e);
            false
        }
    }
}

/// Run to exit, returning the status and stderr lines.
fn run_to_completion(cmd: &mut FfmpegCommand) -> io::Result<(ExitStatus, Vec<String>)> {
    let mut child = cmd.spawn()?;
    drop(child.take_stdin());
    let mut log = String::new();
    if let Some(mut stderr) = child.take_stderr() {
        stderr.read_to_string(&mut log)?;
    }
    let status = child.wait()?;
    Ok((status, log.lines().map(str::to_string).collect()))
}

// ── stderr ──────────────────────────────────────────────────────

/// Forwards ffmpeg's stderr to the log and keeps the last lines.
struct StderrLog {
    tail: Arc<Mutex<VecDeque<String>>>,
    thread: Option<JoinHandle<()>>,
}

impl StderrLog {
    fn start(child: &mut FfmpegChild) -> Self {
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(LOG_TAIL)));
        let thread = child.take_stderr().and_then(|stderr| {
            let tail = Arc::clone(&tail);
            std::thread::Builder::new()
                .name("retrace-ffmpeg-log".to_string())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines() {
                        let Ok(line) = line else { break };
                        debug!(target: "ffmpeg", "{}", line);
                        let mut tail = tail.lock();
                        if tail.len() == LOG_TAIL {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                })
                .ok()
        });
        Self { tail, thread }
    }

    fn tail(&self) -> String {
        self.tail.lock().iter().cloned().collect::<Vec<_>>().join(" | ")
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ── Recording sink ──────────────────────────────────────────────

/// Launches the session recorder, falling back to software encoding.
#[derive(Debug, Clone, Default)]
pub struct FfmpegSinkFactory {
    ffmpeg_path: Option<PathBuf>,
}

impl FfmpegSinkFactory {
    pub fn new(ffmpeg_path: Option<PathBuf>) -> Self {
        Self { ffmpeg_path }
    }
}

impl SinkFactory for FfmpegSinkFactory {
    fn launch(&self, spec: &StreamSpec) -> Result<Box<dyn FrameSink>> {
        let ffmpeg = locate_ffmpeg(self.ffmpeg_path.as_deref())?;
        if let Some(dir) = spec.container.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let codec = if spec.hardware_acceleration && probe_encoder(&ffmpeg, VideoCodec::Nvenc) {
            VideoCodec::Nvenc
        } else {
            VideoCodec::X264
        };

        match FfmpegSink::launch(&ffmpeg, spec, codec) {
            Ok(sink) => Ok(Box::new(sink)),
            Err(e) if codec != VideoCodec::X264 => {
                warn!("Hardware encoder failed to start, relaunching with libx264: {}", e);
                Ok(Box::new(FfmpegSink::launch(&ffmpeg, spec, VideoCodec::X264)?))
            }
            Err(e) => Err(e),
        }
    }
}

/// A running ffmpeg recording process.
pub struct FfmpegSink {
    child: FfmpegChild,
    stdin: Option<ChildStdin>,
    audio: Option<TcpStream>,
    log: StderrLog,
    codec: VideoCodec,
    closed: bool,
}

impl FfmpegSink {
    fn launch(ffmpeg: &Path, spec: &StreamSpec, codec: VideoCodec) -> Result<Self> {
        let listener = match spec.audio {
            Some(_) => Some(TcpListener::bind("127.0.0.1:0")?),
            None => None,
        };
        let audio_addr = listener.as_ref().map(TcpListener::local_addr).transpose()?;

        let args = recording_args(spec, codec, audio_addr);
        debug!(?args, "Launching ffmpeg");
        let mut cmd = command(ffmpeg);
        cmd.args(&args);
        let mut child = cmd
            .spawn()
            .map_err(|e| RetraceError::Encoder(format!("Failed to spawn ffmpeg: {}", e)))?;

        let log = StderrLog::start(&mut child);
        let stdin = child.take_stdin();

        let mut sink = Self {
            child,
            stdin,
            audio: None,
            log,
            codec,
            closed: false,
        };
        if sink.stdin.is_none() {
            sink.kill();
            return Err(RetraceError::Encoder("ffmpeg stdin is not piped".to_string()));
        }

        sink.wait_startup()?;
        if let Some(listener) = listener {
            sink.audio = Some(sink.accept_audio(&listener)?);
        }

        info!(codec = codec.as_ffmpeg_codec(), "ffmpeg recording started");
        Ok(sink)
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    /// Fail if the process exits within the startup probe window.
    fn wait_startup(&mut self) -> Result<()> {
        let deadline = Instant::now() + STARTUP_PROBE;
        while Instant::now() < deadline {
            self.check_alive()?;
            std::thread::sleep(Duration::from_millis(25));
        }
        Ok(())
    }

    fn accept_audio(&mut self, listener: &TcpListener) -> Result<TcpStream> {
        listener.set_nonblocking(true)?;
        let deadline = Instant::now() + AUDIO_CONNECT_TIMEOUT;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    debug!(%peer, "ffmpeg connected for audio");
                    return Ok(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.check_alive()?;
                    if Instant::now() >= deadline {
                        self.kill();
                        return Err(RetraceError::Encoder(
                            "ffmpeg never connected to the audio socket".to_string(),
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    self.kill();
                    return Err(e.into());
                }
            }
        }
    }

    fn check_alive(&mut self) -> Result<()> {
        match self.child.as_inner_mut().try_wait()? {
            None => Ok(()),
            Some(status) => {
                self.closed = true;
                self.log.join();
                Err(RetraceError::Encoder(format!(
                    "ffmpeg exited during startup ({}): {}",
                    status,
                    self.log.tail()
                )))
            }
        }
    }

    fn kill(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.log.join();
    }
}

impl FrameSink for FfmpegSink {
    fn write_frame(&mut self, frame: &VideoFrame) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "ffmpeg stdin closed"))?;
        write_frame_rows(stdin, frame)
    }

    fn take_audio_writer(&mut self) -> Option<Box<dyn Write + Send>> {
        self.audio.take().map(|s| Box::new(s) as Box<dyn Write + Send>)
    }

    fn close(&mut self, grace: Duration) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        // EOF on every input lets ffmpeg finish the container.
        drop(self.stdin.take());
        drop(self.audio.take());

        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = self.child.as_inner_mut().try_wait()? {
                self.closed = true;
                self.log.join();
                if status.success() {
                    info!("ffmpeg finished");
                } else {
                    warn!(%status, log = %self.log.tail(), "ffmpeg exited with an error");
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!("ffmpeg did not exit within {:?}, killing it", grace);
                self.kill();
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        self.kill();
    }
}

// ── Trimmer ─────────────────────────────────────────────────────

/// Cuts clips out of the container with ffmpeg.
#[derive(Debug, Clone, Default)]
pub struct FfmpegTrimmer {
    ffmpeg_path: Option<PathBuf>,
}

impl FfmpegTrimmer {
    pub fn new(ffmpeg_path: Option<PathBuf>) -> Self {
        Self { ffmpeg_path }
    }
}

impl ClipTrimmer for FfmpegTrimmer {
    fn trim(&self, container: &Path, range: ClipRange, output: &Path, method: ExportMethod) -> Result<()> {
        let ffmpeg = locate_ffmpeg(self.ffmpeg_path.as_deref())?;
        let args = trim_args(container, range, output, method);
        debug!(?args, "Trimming clip");

        let mut cmd = command(&ffmpeg);
        cmd.args(&args);
        let (status, log) = run_to_completion(&mut cmd)
            .map_err(|e| RetraceError::Export(format!("Failed to run ffmpeg: {}", e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(RetraceError::Export(format!(
                "ffmpeg {} exited with {}: {}",
                method,
                status,
                log.join(" | ")
            )))
        }
    }
}
