//! Frame acquisition for the behavior monitor.
//!
//! A source is opened once against a locator (file path, RTSP URL, or V4L2
//! device), reports its nominal frame rate and dimensions, and is then
//! drained frame by frame until exhaustion. Decoding happens in an external
//! FFmpeg process; a reader thread forwards raw frames over a small bounded
//! channel so the decoder is backpressured when the consumer falls behind.

mod ffmpeg;
mod types;

pub use ffmpeg::FfmpegSource;
pub use types::{CaptureError, Frame, FrameFormat, SourceInfo, SourceKind};

/// Blocking frame producer opened against a single locator.
pub trait FrameSource {
    /// Nominal frame rate and frame dimensions, reported once at open time.
    fn info(&self) -> SourceInfo;

    /// Next decoded frame, a capture error, or `None` once the stream is
    /// exhausted. Exhaustion is a clean end, not an error.
    fn read(&mut self) -> Option<Result<Frame, CaptureError>>;
}
