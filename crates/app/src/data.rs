//! Shared state and wire payloads passed between the processing loop and the
//! stream endpoints.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use tracker_core::TrackedObject;

use crate::{
    behavior::{Behavior, BehaviorCounts, BehaviorLegend},
    config::MonitorConfig,
};

/// Most recent encoded frame. Exactly one slot, overwritten in place by the
/// producer; no history is retained.
#[derive(Clone)]
pub struct LatestFrame {
    pub jpeg: Vec<u8>,
    pub width: i32,
    pub height: i32,
}

pub type SharedFrame = Arc<Mutex<Option<LatestFrame>>>;

/// Read-only stream descriptors surfaced by the status endpoints.
pub struct StreamStatus {
    pub source: String,
    pub model_path: PathBuf,
    pub mjpeg_fps: u32,
    pub jpeg_quality: i32,
    pub embed_image: bool,
    frame_size: Mutex<(i32, i32)>,
}

impl StreamStatus {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            source: config.source.clone(),
            model_path: config.model_path.clone(),
            mjpeg_fps: config.mjpeg_fps,
            jpeg_quality: config.jpeg_quality,
            embed_image: config.embed_image,
            frame_size: Mutex::new((0, 0)),
        }
    }

    /// Short model name for health reporting.
    pub fn model_name(&self) -> String {
        self.model_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.model_path.display().to_string())
    }

    /// Recorded once by the processing loop after the source opens.
    pub fn set_frame_size(&self, width: i32, height: i32) {
        if let Ok(mut guard) = self.frame_size.lock() {
            *guard = (width, height);
        }
    }

    /// `(0, 0)` until the source has opened.
    pub fn frame_size(&self) -> (i32, i32) {
        self.frame_size.lock().map(|guard| *guard).unwrap_or((0, 0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

/// Behavior annotation attached to a mapped object.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct BehaviorTag {
    pub code: &'static str,
    pub zh: &'static str,
    pub en: &'static str,
}

impl From<Behavior> for BehaviorTag {
    fn from(behavior: Behavior) -> Self {
        Self {
            code: behavior.code(),
            zh: behavior.label_zh(),
            en: behavior.label_en(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ObjectReport {
    /// `null` marks an untracked box, never a synthetic zero.
    pub id: Option<i64>,
    pub class_id: i64,
    pub class_name: String,
    /// `null` when the detector supplied no score.
    pub conf: Option<f32>,
    pub bbox: BoundingBox,
    pub behavior: Option<BehaviorTag>,
}

/// One telemetry message, serialized once and forwarded verbatim to every
/// consumer.
#[derive(Debug, Serialize)]
pub struct FramePayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub source: String,
    pub frame_index: u64,
    pub time_ms: i64,
    pub fps: f32,
    pub objects: Vec<ObjectReport>,
    pub behavior_counts: BehaviorCounts,
    pub behavior_order: [&'static str; 6],
    pub behavior_legend: BehaviorLegend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_jpeg_base64: Option<String>,
}

impl FramePayload {
    /// Assemble the telemetry for one processed frame.
    ///
    /// All six counters start at zero so the payload reports the full
    /// taxonomy regardless of what appeared in this frame; only objects with
    /// a recognized behavior label contribute to the tally.
    pub fn build(
        objects: &[TrackedObject],
        frame_index: u64,
        time_ms: i64,
        fps: f32,
        source: &str,
        image_jpeg: Option<&[u8]>,
    ) -> Self {
        let mut counts = BehaviorCounts::default();
        let reports = objects
            .iter()
            .map(|object| {
                let behavior = Behavior::from_label(&object.class_name);
                if let Some(behavior) = behavior {
                    counts.record(behavior);
                }
                ObjectReport {
                    id: object.track_id,
                    class_id: object.class_id,
                    class_name: object.class_name.clone(),
                    conf: object.confidence,
                    bbox: BoundingBox {
                        x1: object.bbox[0],
                        y1: object.bbox[1],
                        x2: object.bbox[2],
                        y2: object.bbox[3],
                    },
                    behavior: behavior.map(BehaviorTag::from),
                }
            })
            .collect();

        Self {
            kind: "frame",
            source: source.to_string(),
            frame_index,
            time_ms,
            fps: (fps * 100.0).round() / 100.0,
            objects: reports,
            behavior_counts: counts,
            behavior_order: Behavior::CODES,
            behavior_legend: BehaviorLegend::default(),
            image_jpeg_base64: image_jpeg.map(|bytes| BASE64.encode(bytes)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(
        track_id: Option<i64>,
        class_id: i64,
        class_name: &str,
        confidence: Option<f32>,
        bbox: [i32; 4],
    ) -> TrackedObject {
        TrackedObject {
            track_id,
            class_id,
            class_name: class_name.to_string(),
            confidence,
            bbox,
        }
    }

    #[test]
    fn mapped_object_carries_behavior_and_count() {
        let objects = [object(Some(5), 2, "LookingDown", Some(0.81), [10, 20, 50, 80])];
        let payload = FramePayload::build(&objects, 0, 1_700_000_000_000, 24.0, "cam", None);
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["type"], "frame");
        let obj = &json["objects"][0];
        assert_eq!(obj["id"], 5);
        assert!((obj["conf"].as_f64().unwrap() - 0.81).abs() < 1e-6);
        assert_eq!(obj["bbox"]["x1"], 10);
        assert_eq!(obj["bbox"]["y2"], 80);
        assert_eq!(obj["behavior"]["code"], "d");
        assert_eq!(obj["behavior"]["zh"], "低头");
        assert_eq!(obj["behavior"]["en"], "LookingDown");
        assert_eq!(json["behavior_counts"]["d"], 1);
        for code in ["u", "c", "b", "p", "s"] {
            assert_eq!(json["behavior_counts"][code], 0);
        }
    }

    #[test]
    fn unmapped_object_has_null_behavior_and_no_count() {
        let objects = [object(Some(1), 9, "未知类别", Some(0.5), [0, 0, 4, 4])];
        let payload = FramePayload::build(&objects, 3, 0, 10.0, "cam", None);
        let json = serde_json::to_value(&payload).unwrap();

        assert!(json["objects"][0]["behavior"].is_null());
        assert_eq!(payload.behavior_counts.total(), 0);
    }

    #[test]
    fn untracked_and_unscored_fields_serialize_as_null() {
        let objects = [object(None, 0, "Standing", None, [1, 2, 3, 4])];
        let payload = FramePayload::build(&objects, 0, 0, 1.0, "cam", None);
        let json = serde_json::to_value(&payload).unwrap();

        assert!(json["objects"][0]["id"].is_null());
        assert!(json["objects"][0]["conf"].is_null());
    }

    #[test]
    fn counts_sum_to_mapped_objects() {
        let objects = [
            object(Some(1), 0, "LookingUp", Some(0.9), [0, 0, 1, 1]),
            object(Some(2), 1, "LookingDown", Some(0.8), [0, 0, 1, 1]),
            object(Some(3), 1, "looking_down", Some(0.7), [0, 0, 1, 1]),
            object(None, 9, "unknown", None, [0, 0, 1, 1]),
        ];
        let payload = FramePayload::build(&objects, 0, 0, 1.0, "cam", None);
        assert_eq!(payload.behavior_counts.u, 1);
        assert_eq!(payload.behavior_counts.d, 2);
        assert_eq!(payload.behavior_counts.total(), 3);
        assert_eq!(payload.objects.len(), 4);
    }

    #[test]
    fn taxonomy_metadata_is_always_present() {
        let payload = FramePayload::build(&[], 7, 42, 0.0, "cam", None);
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(
            json["behavior_order"],
            serde_json::json!(["u", "d", "c", "b", "p", "s"])
        );
        assert_eq!(json["behavior_legend"]["c"], "趴桌");
        assert_eq!(json["behavior_counts"].as_object().unwrap().len(), 6);
        assert!(json.get("image_jpeg_base64").is_none());
    }

    #[test]
    fn embedded_image_is_base64() {
        let payload = FramePayload::build(&[], 0, 0, 0.0, "cam", Some(&[0xFF, 0xD8, 0xFF]));
        assert_eq!(payload.image_jpeg_base64.as_deref(), Some("/9j/"));
    }

    #[test]
    fn fps_is_rounded_to_two_decimals() {
        let payload = FramePayload::build(&[], 0, 0, 23.4567, "cam", None);
        assert_eq!(payload.fps, 23.46);
    }
}
