//! Single-producer processing loop and process supervision.
//!
//! The loop owns the only tracker invocations, the only writes to the
//! latest-frame slot, and the only `broadcast` calls. Consumers can slow
//! down or disappear without ever stalling it.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Once,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};
use tracker_core::{ObjectTracker, TrackedObject};
use video_ingest::{CaptureError, FfmpegSource, FrameSource};

use crate::{
    annotation,
    broadcast::BroadcastHub,
    config::MonitorConfig,
    data::{FramePayload, LatestFrame, SharedFrame, StreamStatus},
    server::spawn_stream_server,
    telemetry,
};

/// Run the monitor: stream server plus one processing thread.
///
/// The processing thread ends when its source is exhausted; the endpoints
/// keep serving until the operator interrupts the process.
pub fn run<T, F>(config: MonitorConfig, make_tracker: F) -> Result<()>
where
    T: ObjectTracker,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    static CTRL_HANDLER: Once = Once::new();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler({
            let handler_shutdown = handler_shutdown.clone();
            move || {
                handler_shutdown.store(true, Ordering::SeqCst);
            }
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let _ = telemetry::init_metrics_recorder();

    let shared: SharedFrame = Arc::new(Mutex::new(None));
    let hub = Arc::new(BroadcastHub::new());
    let status = Arc::new(StreamStatus::new(&config));

    let server = spawn_stream_server(shared.clone(), hub.clone(), status.clone(), &config)
        .context("Failed to start stream server")?;
    info!(
        "streaming on http://{}/video.mjpg and ws://{}/ws",
        config.bind_addr, config.bind_addr
    );

    let worker = {
        let config = config.clone();
        let shared = shared.clone();
        let hub = hub.clone();
        let status = status.clone();
        let shutdown = shutdown.clone();
        telemetry::spawn_thread("frame-processor", move || {
            let source_uri = config.source.clone();
            processing_loop(
                &config,
                move || FfmpegSource::open(&source_uri),
                make_tracker,
                &shared,
                &hub,
                &status,
                &shutdown,
            );
        })
        .context("Failed to spawn processing thread")?
    };

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    server.stop();
    let _ = worker.join();
    Ok(())
}

/// Drive one source to exhaustion.
///
/// A tracker or source that fails to come up is terminal for the loop but
/// not for the process: the endpoints keep serving whatever was already
/// published. Per-frame encode failures only skip that frame's image
/// publish; telemetry still goes out.
pub(crate) fn processing_loop<S, T>(
    config: &MonitorConfig,
    open_source: impl FnOnce() -> Result<S, CaptureError>,
    make_tracker: impl FnOnce() -> Result<T>,
    shared: &SharedFrame,
    hub: &BroadcastHub,
    status: &StreamStatus,
    shutdown: &AtomicBool,
) where
    S: FrameSource,
    T: ObjectTracker,
{
    let mut tracker = match make_tracker() {
        Ok(tracker) => tracker,
        Err(err) => {
            error!("failed to initialise tracker: {err:?}");
            return;
        }
    };
    let mut source = match open_source() {
        Ok(source) => source,
        Err(err) => {
            error!("{err}");
            return;
        }
    };

    let info = source.info();
    status.set_frame_size(info.width, info.height);
    let stride = ((info.fps * config.infer_interval_secs).floor() as u64).max(1);
    info!(
        "processing started: source={}, fps≈{:.2}, size={}x{}, inference every {} frame(s)",
        config.source, info.fps, info.width, info.height, stride
    );

    let mut frame_index: u64 = 0;
    let mut infer_count: u64 = 0;
    let mut last_objects: Vec<TrackedObject> = Vec::new();
    let started = Instant::now();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let frame = match source.read() {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                error!("capture error: {err}");
                break;
            }
            None => break,
        };

        if frame_index % stride == 0 {
            match tracker.track(&frame) {
                Ok(objects) => {
                    last_objects = objects;
                    infer_count += 1;
                    metrics::counter!("classwatch_inference_total").increment(1);
                }
                Err(err) => {
                    error!("inference failed on frame {frame_index}: {err:?}");
                    break;
                }
            }
        }

        let elapsed = started.elapsed().as_secs_f32();
        let fps = if elapsed > 0.0 {
            (frame_index + 1) as f32 / elapsed
        } else {
            0.0
        };

        let mut embedded: Option<Vec<u8>> = None;
        match annotation::annotate_frame(&frame, &last_objects, frame_index, fps, config.jpeg_quality)
        {
            Ok(jpeg) => {
                if config.embed_image {
                    embedded = Some(jpeg.clone());
                }
                if let Ok(mut guard) = shared.lock() {
                    *guard = Some(LatestFrame {
                        jpeg,
                        width: frame.width,
                        height: frame.height,
                    });
                }
            }
            Err(err) => {
                warn!("frame {frame_index}: encode failed, skipping image publish: {err}");
                metrics::counter!("classwatch_encode_errors_total").increment(1);
            }
        }

        let payload = FramePayload::build(
            &last_objects,
            frame_index,
            Utc::now().timestamp_millis(),
            fps,
            &config.source,
            embedded.as_deref(),
        );
        match serde_json::to_string(&payload) {
            Ok(message) => {
                let displaced = hub.broadcast(&message);
                if displaced > 0 {
                    metrics::counter!("classwatch_dropped_payloads_total")
                        .increment(displaced as u64);
                }
            }
            Err(err) => warn!("frame {frame_index}: payload serialization failed: {err}"),
        }

        metrics::counter!("classwatch_frames_total").increment(1);
        metrics::gauge!("classwatch_processing_fps").set(fps as f64);
        metrics::gauge!("classwatch_telemetry_clients").set(hub.len() as f64);

        frame_index += 1;
    }

    info!("processing finished: {frame_index} frame(s), {infer_count} inference pass(es)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        path::PathBuf,
        sync::atomic::AtomicUsize,
    };
    use video_ingest::{Frame, FrameFormat, SourceInfo};

    struct SyntheticSource {
        frames: VecDeque<Frame>,
        info: SourceInfo,
    }

    impl SyntheticSource {
        fn new(count: usize, width: i32, height: i32, fps: f64) -> Self {
            let frames = (0..count)
                .map(|_| Frame {
                    data: vec![0x20; (width * height * 3) as usize],
                    width,
                    height,
                    timestamp_ms: 0,
                    format: FrameFormat::Bgr8,
                })
                .collect();
            Self {
                frames,
                info: SourceInfo { width, height, fps },
            }
        }
    }

    impl FrameSource for SyntheticSource {
        fn info(&self) -> SourceInfo {
            self.info
        }

        fn read(&mut self) -> Option<Result<Frame, CaptureError>> {
            self.frames.pop_front().map(Ok)
        }
    }

    struct ScriptedTracker {
        calls: Arc<AtomicUsize>,
        objects: Vec<TrackedObject>,
    }

    impl ObjectTracker for ScriptedTracker {
        fn track(&mut self, _frame: &Frame) -> Result<Vec<TrackedObject>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.objects.clone())
        }
    }

    fn test_config(infer_interval_secs: f64) -> MonitorConfig {
        MonitorConfig {
            source: "synthetic".to_string(),
            model_path: PathBuf::from("model.pt"),
            labels_path: None,
            bind_addr: "127.0.0.1:0".to_string(),
            jpeg_quality: 80,
            mjpeg_fps: 20,
            infer_interval_secs,
            conf_threshold: 0.25,
            iou_threshold: 0.30,
            detector_width: 640,
            detector_height: 640,
            embed_image: false,
            use_cpu: true,
            verbose: false,
        }
    }

    fn looking_down() -> TrackedObject {
        TrackedObject {
            track_id: Some(5),
            class_id: 2,
            class_name: "LookingDown".to_string(),
            confidence: Some(0.81),
            bbox: [10, 20, 50, 80],
        }
    }

    #[actix_web::test]
    async fn loop_throttles_inference_and_publishes_freshest() {
        // 10 fps source, 0.2 s interval -> stride 2 -> inference on 0, 2, 4
        let config = test_config(0.2);
        let shared: SharedFrame = Arc::new(Mutex::new(None));
        let hub = BroadcastHub::new();
        let status = StreamStatus::new(&config);
        let shutdown = AtomicBool::new(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = hub.register();

        processing_loop(
            &config,
            || Ok(SyntheticSource::new(6, 32, 24, 10.0)),
            || {
                Ok(ScriptedTracker {
                    calls: calls.clone(),
                    objects: vec![looking_down()],
                })
            },
            &shared,
            &hub,
            &status,
            &shutdown,
        );

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(status.frame_size(), (32, 24));

        let latest = shared.lock().unwrap().clone().expect("latest frame published");
        assert_eq!((latest.width, latest.height), (32, 24));
        assert!(image::load_from_memory(&latest.jpeg).is_ok());

        // capacity 2: only the freshest two payloads remain, in order
        let third = sub.recv().await.expect("payload");
        let fourth = sub.recv().await.expect("payload");
        let third: serde_json::Value = serde_json::from_str(&third).unwrap();
        let fourth: serde_json::Value = serde_json::from_str(&fourth).unwrap();
        assert_eq!(third["frame_index"], 4);
        assert_eq!(fourth["frame_index"], 5);
        assert_eq!(third["behavior_counts"]["d"], 1);
        assert_eq!(third["objects"][0]["behavior"]["code"], "d");
    }

    #[actix_web::test]
    async fn every_frame_reuses_the_last_detection_result() {
        let config = test_config(10.0); // stride far above the frame count
        let shared: SharedFrame = Arc::new(Mutex::new(None));
        let hub = BroadcastHub::new();
        let status = StreamStatus::new(&config);
        let shutdown = AtomicBool::new(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = hub.register();

        processing_loop(
            &config,
            || Ok(SyntheticSource::new(4, 16, 16, 1.0)),
            || {
                Ok(ScriptedTracker {
                    calls: calls.clone(),
                    objects: vec![looking_down()],
                })
            },
            &shared,
            &hub,
            &status,
            &shutdown,
        );

        // one inference pass, but every payload still reports the objects
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let last: serde_json::Value =
            serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(last["objects"].as_array().unwrap().len(), 1);
    }

    #[actix_web::test]
    async fn consumer_frame_indices_never_decrease() {
        let config = test_config(0.1);
        let shared: SharedFrame = Arc::new(Mutex::new(None));
        let hub = Arc::new(BroadcastHub::new());
        let status = Arc::new(StreamStatus::new(&config));
        let shutdown = Arc::new(AtomicBool::new(false));
        let sub = hub.register();

        let worker = {
            let (config, shared) = (config.clone(), shared.clone());
            let (hub, status, shutdown) = (hub.clone(), status.clone(), shutdown.clone());
            let calls = Arc::new(AtomicUsize::new(0));
            thread::spawn(move || {
                processing_loop(
                    &config,
                    || Ok(SyntheticSource::new(40, 16, 16, 30.0)),
                    || Ok(ScriptedTracker { calls, objects: Vec::new() }),
                    &shared,
                    &hub,
                    &status,
                    &shutdown,
                );
            })
        };

        let mut indices = Vec::new();
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(500), sub.recv()).await
        {
            let payload: serde_json::Value = serde_json::from_str(&message).unwrap();
            indices.push(payload["frame_index"].as_u64().unwrap());
            if indices.last() == Some(&39) {
                break;
            }
        }
        worker.join().unwrap();

        assert!(!indices.is_empty());
        assert!(indices.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(*indices.last().unwrap(), 39);
    }

    #[actix_web::test]
    async fn unopenable_source_is_terminal_but_quiet() {
        let config = test_config(0.5);
        let shared: SharedFrame = Arc::new(Mutex::new(None));
        let hub = BroadcastHub::new();
        let status = StreamStatus::new(&config);
        let shutdown = AtomicBool::new(false);
        let sub = hub.register();

        processing_loop(
            &config,
            || {
                Err::<SyntheticSource, _>(CaptureError::Open {
                    uri: "synthetic".to_string(),
                })
            },
            || {
                Ok(ScriptedTracker {
                    calls: Arc::new(AtomicUsize::new(0)),
                    objects: Vec::new(),
                })
            },
            &shared,
            &hub,
            &status,
            &shutdown,
        );

        assert!(shared.lock().unwrap().is_none());
        assert_eq!(status.frame_size(), (0, 0));
        assert_eq!(sub.pending(), 0);
    }
}
