//! Detection-and-tracking seam for the behavior monitor.
//!
//! The processing loop only ever sees [`ObjectTracker`]; the TorchScript
//! implementation lives behind the `with-tch` feature so the server, the
//! broadcast core, and the test suite all build without libtorch.

mod track;
#[cfg(feature = "with-tch")]
mod torch;

pub use track::{iou, suppress, Candidate, TrackAssigner};
#[cfg(feature = "with-tch")]
pub use torch::TorchTracker;

#[cfg(feature = "with-tch")]
pub use tch;

use anyhow::Result;
use video_ingest::Frame;

/// One tracked detection in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedObject {
    /// Stable identity; absent while the tracker cannot vouch for continuity.
    /// Never a synthetic zero.
    pub track_id: Option<i64>,
    pub class_id: i64,
    pub class_name: String,
    /// Absent when the model reports no score for this box.
    pub confidence: Option<f32>,
    /// `[x1, y1, x2, y2]` with `x1 <= x2` and `y1 <= y2`.
    pub bbox: [i32; 4],
}

/// Detection-and-tracking model invoked by the processing loop.
///
/// `track` is synchronous and may block for the full inference latency; the
/// caller decides how often it is worth paying that cost.
pub trait ObjectTracker {
    fn track(&mut self, frame: &Frame) -> Result<Vec<TrackedObject>>;
}
