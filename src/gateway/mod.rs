//! HTTP surface: deployment config, request decoding and the axum router.

pub mod config;
pub mod http;
pub mod input;
mod multipart;
pub mod telemetry;

pub use config::{GatewayConfig, ProxyImageConfig};
pub use http::{ApiError, GatewayHttpState, router};
pub use input::UploadedImage;
pub use telemetry::{TelemetryConfig, TelemetryGuard, init_tracing};
