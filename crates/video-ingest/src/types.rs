use anyhow::Error;
use thiserror::Error;

/// Raw decoded frame handed to the processing loop.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

/// Stream properties a source reports when it opens.
#[derive(Clone, Copy, Debug)]
pub struct SourceInfo {
    pub width: i32,
    pub height: i32,
    pub fps: f64,
}

/// How a locator string is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Rtsp,
    Device,
}

impl SourceKind {
    pub fn from_uri(uri: &str) -> Self {
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            SourceKind::Rtsp
        } else if uri.parse::<u32>().is_ok() || uri.starts_with("/dev/video") {
            SourceKind::Device
        } else {
            SourceKind::File
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error(transparent)]
    Other(#[from] Error),
}
