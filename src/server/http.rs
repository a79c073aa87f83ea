//! HTTP server assembly.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderName, Method};
use axum::routing::{get, post};
use axum::Router;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};

use super::config::ServerConfig;
use super::handlers::{
    handle_health, handle_ingest, handle_label_values, handle_labels, handle_metrics,
    handle_query, AppState,
};
use super::middleware::{require_api_key, track_metrics};
use super::{loki, stream};
use crate::error::Result;

/// HTTP server for the log service.
pub struct LogServer {
    state: AppState,
    config: ServerConfig,
}

impl LogServer {
    pub fn new(state: AppState, config: ServerConfig) -> Self {
        Self { state, config }
    }

    /// Builds the router with all routes and middleware.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([
                header::CONTENT_TYPE,
                HeaderName::from_static("x-api-key"),
                header::AUTHORIZATION,
            ]);

        let mut router = Router::new()
            .route("/health", get(handle_health))
            .route("/ingest", post(handle_ingest))
            .route("/query", get(handle_query))
            .route("/labels", get(handle_labels))
            .route("/labels/:name/values", get(handle_label_values))
            .route("/metrics", get(handle_metrics))
            .route("/stream", get(stream::handle_stream))
            .route("/ready", get(loki::handle_ready))
            .route("/loki/api/v1/query_range", get(loki::handle_query_range))
            .route("/loki/api/v1/query", get(loki::handle_instant_query))
            .route("/loki/api/v1/labels", get(loki::handle_labels))
            .route(
                "/loki/api/v1/label/:name/values",
                get(loki::handle_label_values),
            )
            .layer(axum::middleware::from_fn_with_state(
                self.state.metrics.clone(),
                track_metrics,
            ))
            .layer(cors);

        if let Some(api_key) = &self.config.api_key {
            router = router.layer(axum::middleware::from_fn_with_state(
                Arc::new(api_key.clone()),
                require_api_key,
            ));
        }

        router.with_state(self.state.clone())
    }

    /// Binds and serves until SIGINT/SIGTERM, then stops the ingestor so
    /// every buffered entry gets its final flush.
    pub async fn run(self) -> Result<()> {
        let app = self.router();
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Starting loglake HTTP server on {}", addr);
        tracing::info!("Live tail available at ws://{}/stream", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.state.ingestor.stop().await;
        tracing::info!("Server shut down gracefully");
        Ok(())
    }
}

/// Listen for SIGTERM (pod termination) and SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
