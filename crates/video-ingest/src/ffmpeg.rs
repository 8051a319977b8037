//! FFmpeg-backed frame source.
//!
//! The stream is probed once with `ffprobe` for its nominal rate and frame
//! size, then decoded by a spawned `ffmpeg` process emitting raw `bgr24`
//! frames over stdout. A reader thread slices stdout into frames and forwards
//! them over a bounded channel; the buffer is intentionally small to
//! backpressure decoding when the processing loop falls behind.

use std::{
    io::{ErrorKind, Read},
    process::{Child, Command, Stdio},
    thread,
};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

use crate::{
    types::{CaptureError, Frame, FrameFormat, SourceInfo, SourceKind},
    FrameSource,
};

/// Frames buffered between the decode thread and the consumer.
const CHANNEL_DEPTH: usize = 2;

/// Video source decoded by an external FFmpeg process.
pub struct FfmpegSource {
    info: SourceInfo,
    rx: Receiver<Result<Frame, CaptureError>>,
    child: Child,
}

impl FfmpegSource {
    /// Probe the locator, spawn the decoder, and start the reader thread.
    ///
    /// A locator that cannot be probed or decoded is reported as
    /// [`CaptureError::Open`]; nothing is retried here.
    pub fn open(uri: &str) -> Result<Self, CaptureError> {
        let kind = SourceKind::from_uri(uri);
        let info = match probe(uri, kind) {
            Ok(info) => info,
            Err(err) => {
                debug!("probe of {uri} failed: {err:#}");
                return Err(CaptureError::Open {
                    uri: uri.to_string(),
                });
            }
        };

        let mut child = decode_command(uri, kind)
            .spawn()
            .map_err(|err| CaptureError::Other(anyhow!("failed to spawn ffmpeg: {err}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

        let (tx, rx) = bounded(CHANNEL_DEPTH);
        let size = (info.width, info.height);
        thread::spawn(move || read_loop(stdout, size, tx));

        Ok(Self { info, rx, child })
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn read(&mut self) -> Option<Result<Frame, CaptureError>> {
        self.rx.recv().ok()
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Resolve a device locator ("0" or "/dev/video0") to its device node.
fn device_path(uri: &str) -> String {
    if let Some(index) = parse_device_index(uri) {
        format!("/dev/video{index}")
    } else {
        uri.to_string()
    }
}

fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.parse::<i32>().ok();
        }
    }
    None
}

/// Build the decode command for the locator kind.
fn decode_command(uri: &str, kind: SourceKind) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");

    let input = match kind {
        SourceKind::Rtsp => {
            cmd.arg("-rtsp_transport")
                .arg("tcp")
                .arg("-fflags")
                .arg("nobuffer")
                .arg("-flags")
                .arg("low_delay")
                .arg("-max_delay")
                .arg("0");
            uri.to_string()
        }
        SourceKind::Device => {
            cmd.arg("-f").arg("video4linux2");
            device_path(uri)
        }
        SourceKind::File => uri.to_string(),
    };

    cmd.arg("-i")
        .arg(input)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-")
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    cmd
}

/// Query the first video stream for width, height, and average frame rate.
fn probe(uri: &str, kind: SourceKind) -> Result<SourceInfo> {
    let mut cmd = Command::new("ffprobe");
    cmd.arg("-v").arg("error");
    match kind {
        SourceKind::Rtsp => {
            cmd.arg("-rtsp_transport").arg("tcp");
        }
        SourceKind::Device => {
            cmd.arg("-f").arg("video4linux2");
        }
        SourceKind::File => {}
    }
    let target = match kind {
        SourceKind::Device => device_path(uri),
        _ => uri.to_string(),
    };

    let output = cmd
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height,avg_frame_rate")
        .arg("-of")
        .arg("csv=p=0")
        .arg(&target)
        .output()
        .context("failed to run ffprobe")?;
    if !output.status.success() {
        bail!("ffprobe exited with {}", output.status);
    }

    let line = std::str::from_utf8(&output.stdout)
        .context("ffprobe output is not UTF-8")?
        .trim();
    parse_probe_line(line)
}

fn parse_probe_line(line: &str) -> Result<SourceInfo> {
    let mut fields = line.split(',');
    let width: i32 = fields
        .next()
        .unwrap_or_default()
        .trim()
        .parse()
        .with_context(|| format!("unparseable probe line {line:?}"))?;
    let height: i32 = fields
        .next()
        .unwrap_or_default()
        .trim()
        .parse()
        .with_context(|| format!("unparseable probe line {line:?}"))?;
    if width <= 0 || height <= 0 {
        bail!("probe reported invalid frame size {width}x{height}");
    }
    let fps = parse_rate(fields.next().unwrap_or_default().trim());
    Ok(SourceInfo { width, height, fps })
}

/// Parse an ffprobe rational rate such as `30000/1001`.
///
/// Sources that do not advertise a usable rate ("0/0", empty) fall back to
/// a nominal 30 fps.
fn parse_rate(raw: &str) -> f64 {
    let value = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().unwrap_or(0.0);
            let den: f64 = den.trim().parse().unwrap_or(0.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => raw.parse().unwrap_or(0.0),
    };
    if value.is_finite() && value > 0.0 {
        value
    } else {
        30.0
    }
}

fn read_loop(mut stdout: impl Read, size: (i32, i32), tx: Sender<Result<Frame, CaptureError>>) {
    let (width, height) = size;
    let frame_bytes = (width as usize) * (height as usize) * 3;
    let mut buffer = vec![0u8; frame_bytes];

    loop {
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                let frame = Frame {
                    data: buffer.clone(),
                    width,
                    height,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    format: FrameFormat::Bgr8,
                };
                if tx.send(Ok(frame)).is_err() {
                    break;
                }
            }
            // End of stream: a partial trailing frame is discarded.
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => {
                let _ = tx.send(Err(CaptureError::Other(err.into())));
                break;
            }
        }
    }
}
