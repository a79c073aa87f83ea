//! HTTP server: REST surface, WebSocket live tail, metrics exposition.

pub mod config;
pub mod error;
pub mod handlers;
pub mod http;
pub mod loki;
pub mod metrics;
pub mod middleware;
pub mod stream;

pub use config::{CliArgs, ServerConfig};
pub use handlers::AppState;
pub use http::LogServer;
pub use metrics::Metrics;
