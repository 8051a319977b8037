//! TorchScript-backed detector with track assignment.
//!
//! Accepts BGR frames at any size; boxes come back in frame pixel
//! coordinates with identities attached by the IoU assigner.

use std::{convert::TryFrom, path::Path};

use anyhow::{bail, Result};
use tch::{CModule, Device, Kind, Tensor};
use tracing::debug;
use video_ingest::{Frame, FrameFormat};

use crate::{
    track::{suppress, Candidate, TrackAssigner},
    ObjectTracker, TrackedObject,
};

pub struct TorchTracker {
    module: CModule,
    device: Device,
    input_size: (i64, i64),
    class_names: Vec<String>,
    confidence_threshold: f32,
    iou_threshold: f32,
    assigner: TrackAssigner,
}

impl TorchTracker {
    /// Load a TorchScript module and prepare it for inference on `device`.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
        class_names: Vec<String>,
    ) -> Result<Self> {
        let module = CModule::load_on_device(model_path, device)?;
        Ok(Self {
            module,
            device,
            input_size,
            class_names,
            confidence_threshold: 0.25,
            iou_threshold: 0.30,
            assigner: TrackAssigner::new(0.3),
        })
    }

    /// Override the confidence filter and NMS overlap thresholds.
    pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Self {
        self.confidence_threshold = confidence;
        self.iou_threshold = iou;
        self
    }

    /// Convert a BGR frame into a normalized RGB tensor at the detector
    /// input size.
    fn frame_to_tensor(&self, frame: &Frame) -> Result<Tensor> {
        if !matches!(frame.format, FrameFormat::Bgr8) {
            bail!("unsupported frame format");
        }
        let expected = (frame.width as usize) * (frame.height as usize) * 3;
        if frame.data.len() != expected {
            bail!(
                "unexpected frame buffer size: got {} bytes, expected {expected}",
                frame.data.len()
            );
        }

        let (in_w, in_h) = self.input_size;
        let tensor = Tensor::from_slice(&frame.data)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, frame.height as i64, frame.width as i64, 3])
            .permute([0, 3, 1, 2])
            .flip([1]) // BGR -> RGB
            / 255.0;
        Ok(tensor.upsample_bilinear2d([in_h, in_w], false, None, None))
    }

    /// Decode YOLO-style rows `(cx, cy, w, h, conf, class)` into candidates
    /// scaled back to frame pixels.
    fn decode_output(&self, output: &Tensor, frame_w: i32, frame_h: i32) -> Result<Vec<Candidate>> {
        let shape = output.size();
        if shape.len() != 3 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[0] != 1 {
            bail!("detector expected batch=1 but received {}", shape[0]);
        }
        if shape[1] < 6 {
            bail!(
                "detector output requires at least 6 channels (x,y,w,h,conf,class), got {}",
                shape[1]
            );
        }

        let preds = output
            .to_device(Device::Cpu)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let (in_w, in_h) = self.input_size;
        let scale_x = frame_w as f32 / in_w as f32;
        let scale_y = frame_h as f32 / in_h as f32;
        let max_x = (frame_w - 1) as f32;
        let max_y = (frame_h - 1) as f32;

        let mut candidates = Vec::new();
        for row in rows {
            if row.len() < 6 {
                continue;
            }
            let score = row[4];
            if score < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            let bbox = [
                ((cx - w / 2.0) * scale_x).clamp(0.0, max_x),
                ((cy - h / 2.0) * scale_y).clamp(0.0, max_y),
                ((cx + w / 2.0) * scale_x).clamp(0.0, max_x),
                ((cy + h / 2.0) * scale_y).clamp(0.0, max_y),
            ];
            candidates.push(Candidate {
                bbox,
                score,
                class_id: row[5] as i64,
            });
            if candidates.len() >= 512 {
                break;
            }
        }

        Ok(suppress(candidates, self.iou_threshold))
    }

    fn class_name(&self, class_id: i64) -> String {
        usize::try_from(class_id)
            .ok()
            .and_then(|idx| self.class_names.get(idx).cloned())
            .unwrap_or_else(|| class_id.to_string())
    }
}

impl ObjectTracker for TorchTracker {
    fn track(&mut self, frame: &Frame) -> Result<Vec<TrackedObject>> {
        let input = self.frame_to_tensor(frame)?;
        let output = self.module.forward_ts(&[input])?;
        let candidates = self.decode_output(&output, frame.width, frame.height)?;

        let keyed: Vec<([f32; 4], i64)> = candidates
            .iter()
            .map(|candidate| (candidate.bbox, candidate.class_id))
            .collect();
        let ids = self.assigner.assign(&keyed);
        debug!("tracked {} object(s)", candidates.len());

        Ok(candidates
            .into_iter()
            .zip(ids)
            .map(|(candidate, track_id)| TrackedObject {
                track_id,
                class_id: candidate.class_id,
                class_name: self.class_name(candidate.class_id),
                confidence: Some(candidate.score),
                bbox: [
                    candidate.bbox[0].round() as i32,
                    candidate.bbox[1].round() as i32,
                    candidate.bbox[2].round() as i32,
                    candidate.bbox[3].round() as i32,
                ],
            })
            .collect())
    }
}
