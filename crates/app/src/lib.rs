//! Live classroom-behavior monitor: one slow detector, any number of
//! viewers, always the freshest data.
//!
//! The crate is split into focused modules:
//! - `config`: CLI configuration parsing.
//! - `behavior`: canonical six-category taxonomy and label mapping.
//! - `data`: latest-frame slot, stream status, and wire payloads.
//! - `annotation`: overlay drawing and JPEG encoding.
//! - `broadcast`: bounded drop-oldest fan-out to telemetry consumers.
//! - `pipeline`: the single-producer processing loop and supervision.
//! - `server`: Actix Web MJPEG, WebSocket, and status endpoints.
//! - `telemetry`: tracing and metrics plumbing.

pub mod annotation;
pub mod behavior;
pub mod broadcast;
pub mod config;
pub mod data;
pub mod pipeline;
pub mod server;
pub mod telemetry;
