//! Actix Web endpoints: the MJPEG stream, the telemetry WebSocket, and the
//! status/metrics routes.
//!
//! The server runs on a dedicated thread so connection handling never shares
//! a runtime with the processing hot path. Each connection gets its own
//! task; a slow or dead client only ever hurts itself.

use std::{sync::Arc, time::Duration};

use actix_web::{
    http::header,
    web::{self, Bytes},
    App, HttpRequest, HttpResponse, HttpServer,
};
use actix_ws::Message;
use anyhow::{Context, Result};
use async_stream::stream;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::{
    broadcast::BroadcastHub,
    config::MonitorConfig,
    data::{SharedFrame, StreamStatus},
    telemetry,
};

/// Boundary token for the multipart image stream.
const MJPEG_BOUNDARY: &str = "frameboundary";

/// Shared state backing HTTP handlers.
struct ServerState {
    latest: SharedFrame,
    hub: Arc<BroadcastHub>,
    status: Arc<StreamStatus>,
}

/// Handle for the server thread.
pub struct StreamServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl StreamServer {
    /// Signal the server to stop and block until the thread exits.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the server thread and return a handle that can stop it.
pub fn spawn_stream_server(
    latest: SharedFrame,
    hub: Arc<BroadcastHub>,
    status: Arc<StreamStatus>,
    config: &MonitorConfig,
) -> Result<StreamServer> {
    let bind_addr = config.bind_addr.clone();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("stream-server".into())
        .spawn(move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(ServerState {
                            latest: latest.clone(),
                            hub: hub.clone(),
                            status: status.clone(),
                        }))
                        .route("/video.mjpg", web::get().to(mjpeg_handler))
                        .route("/ws", web::get().to(ws_handler))
                        .route("/health", web::get().to(health_handler))
                        .route("/config", web::get().to(config_handler))
                        .route("/metrics", web::get().to(metrics_handler))
                })
                .bind(bind_addr.as_str())?
                .run();

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            }) {
                error!("HTTP server error: {err}");
            }
        })
        .context("Failed to spawn stream server thread")?;
    Ok(StreamServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

/// Frame one JPEG as a multipart section with an explicit length.
fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let mut part = Vec::with_capacity(jpeg.len() + 96);
    part.extend_from_slice(
        format!(
            "--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        )
        .as_bytes(),
    );
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// Serve the latest-frame slot as a continuous multipart stream.
///
/// Every connection samples the slot on its own timer. A tick with nothing
/// cached emits no part, so a client connecting before the first frame just
/// waits; a client polling faster than the producer re-sees the same frame.
async fn mjpeg_handler(state: web::Data<ServerState>) -> HttpResponse {
    let period = Duration::from_secs_f64(1.0 / f64::from(state.status.mjpeg_fps.max(1)));
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(period);
        loop {
            interval.tick().await;
            let frame = state
                .latest
                .lock()
                .ok()
                .and_then(|guard| guard.clone());
            if let Some(frame) = frame {
                yield Ok::<Bytes, actix_web::Error>(Bytes::from(multipart_part(&frame.jpeg)));
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-cache, private"))
        .insert_header((header::PRAGMA, "no-cache"))
        .insert_header((header::AGE, "0"))
        .insert_header((
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"),
        ))
        .streaming(stream)
}

/// Telemetry push feed: register a bounded queue, forward payloads verbatim,
/// deregister on the first failed send or client close.
async fn ws_handler(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<ServerState>,
) -> actix_web::Result<HttpResponse> {
    let (response, mut session, mut msg_stream) = actix_ws::handle(&req, body)?;
    let hub = state.hub.clone();
    let subscription = hub.register();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                payload = subscription.recv() => match payload {
                    Some(message) => {
                        if session.text(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                control = msg_stream.recv() => match control {
                    Some(Ok(Message::Ping(bytes))) => {
                        if session.pong(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // downstream-only feed; inbound data is ignored
                    Some(Ok(_)) => {}
                },
            }
        }
        debug!("telemetry client #{} disconnected", subscription.id());
        hub.deregister(&subscription);
        let _ = session.close(None).await;
    });

    Ok(response)
}

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'static str,
    model: String,
    source: &'a str,
}

async fn health_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        model: state.status.model_name(),
        source: &state.status.source,
    })
}

#[derive(Serialize)]
struct FrameSize {
    width: i32,
    height: i32,
}

#[derive(Serialize)]
struct ConfigResponse<'a> {
    model_path: String,
    source: &'a str,
    include_image_in_json: bool,
    jpeg_quality: i32,
    mjpeg_fps: u32,
    frame_size: FrameSize,
}

async fn config_handler(state: web::Data<ServerState>) -> HttpResponse {
    let (width, height) = state.status.frame_size();
    HttpResponse::Ok().json(ConfigResponse {
        model_path: state.status.model_path.display().to_string(),
        source: &state.status.source,
        include_image_in_json: state.status.embed_image,
        jpeg_quality: state.status.jpeg_quality,
        mjpeg_fps: state.status.mjpeg_fps,
        frame_size: FrameSize { width, height },
    })
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().finish(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{body::to_bytes, test};
    use std::{path::PathBuf, sync::Mutex};

    fn test_state() -> web::Data<ServerState> {
        let config = MonitorConfig {
            source: "input/lecture.mp4".to_string(),
            model_path: PathBuf::from("models/best.pt"),
            labels_path: None,
            bind_addr: "127.0.0.1:0".to_string(),
            jpeg_quality: 80,
            mjpeg_fps: 20,
            infer_interval_secs: 0.5,
            conf_threshold: 0.25,
            iou_threshold: 0.30,
            detector_width: 640,
            detector_height: 640,
            embed_image: false,
            use_cpu: true,
            verbose: false,
        };
        web::Data::new(ServerState {
            latest: Arc::new(Mutex::new(None)),
            hub: Arc::new(BroadcastHub::new()),
            status: Arc::new(StreamStatus::new(&config)),
        })
    }

    #[::core::prelude::v1::test]
    fn multipart_parts_carry_length_and_boundary() {
        let jpeg = [0xFFu8, 0xD8, 0xFF, 0xD9];
        let part = multipart_part(&jpeg);
        let text = String::from_utf8_lossy(&part);
        assert!(text.starts_with("--frameboundary\r\n"));
        assert!(text.contains("Content-Type: image/jpeg\r\n"));
        assert!(text.contains("Content-Length: 4\r\n\r\n"));
        assert!(part.ends_with(b"\r\n"));
        assert!(part.windows(jpeg.len()).any(|window| window == jpeg));
    }

    #[actix_web::test]
    async fn mjpeg_response_disables_caching() {
        let response = mjpeg_handler(test_state()).await;
        let headers = response.headers();
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-cache, private");
        assert_eq!(headers.get(header::PRAGMA).unwrap(), "no-cache");
        assert_eq!(
            headers.get(header::CONTENT_TYPE).unwrap(),
            "multipart/x-mixed-replace; boundary=frameboundary"
        );
    }

    #[actix_web::test]
    async fn health_reports_model_and_source() {
        let app = test::init_service(
            App::new()
                .app_data(test_state())
                .route("/health", web::get().to(health_handler)),
        )
        .await;
        let response = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert!(response.status().is_success());
        let body: serde_json::Value =
            serde_json::from_slice(&to_bytes(response.into_body()).await.unwrap()).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["model"], "best.pt");
        assert_eq!(body["source"], "input/lecture.mp4");
    }

    #[actix_web::test]
    async fn config_reports_stream_parameters() {
        let state = test_state();
        state.status.set_frame_size(1280, 720);
        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/config", web::get().to(config_handler)),
        )
        .await;
        let response = test::call_service(&app, test::TestRequest::get().uri("/config").to_request()).await;
        let body: serde_json::Value =
            serde_json::from_slice(&to_bytes(response.into_body()).await.unwrap()).unwrap();
        assert_eq!(body["mjpeg_fps"], 20);
        assert_eq!(body["jpeg_quality"], 80);
        assert_eq!(body["include_image_in_json"], false);
        assert_eq!(body["frame_size"]["width"], 1280);
        assert_eq!(body["frame_size"]["height"], 720);
    }
}
